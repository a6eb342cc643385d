//! Face detection and tracking CLI
//!
//! Single-image detection or multi-frame tracking over a list of frame
//! image paths, emitting JSON to stdout.

use facetrack::embedding::{EmbeddingConfig, EmbeddingExtractor, MobileFaceNetEmbedder};
use facetrack::{
    FaceDetector, FacePipeline, FaceRecord, ImageData, ImageReport, PipelineConfig, ScrfdDetector,
};
use std::io::BufRead;
use std::process::exit;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_INVALID_ARGS: i32 = 1;
const EXIT_MODEL_NOT_FOUND: i32 = 2;
const EXIT_IMAGE_LOAD_FAILED: i32 = 3;
const EXIT_INFERENCE_FAILED: i32 = 4;
const EXIT_NO_INPUT: i32 = 5;
const EXIT_SELF_TEST_FAILED: i32 = 6;

#[derive(Debug, Clone)]
struct Args {
    model_dir: String,
    image_path: String,
    images_file: String,
    reid_model_dir: String,
    track_mode: bool,
    test_ocsort: bool,
    conf_thresh: f32,
    nms_thresh: f32,
    iou_thresh: f32,
    detection_fps: f32,
    video_fps: f32,
    reid_weight: f32,
    reid_cos_thresh: f32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            model_dir: String::new(),
            image_path: String::new(),
            images_file: String::new(),
            reid_model_dir: String::new(),
            track_mode: false,
            test_ocsort: false,
            conf_thresh: 0.5,
            nms_thresh: 0.4,
            iou_thresh: 0.15,
            detection_fps: 5.0,
            video_fps: 30.0,
            reid_weight: 0.35,
            reid_cos_thresh: 0.35,
        }
    }
}

fn print_usage(prog: &str) {
    eprintln!("Face Detection and Tracking Pipeline\n");
    eprintln!("Usage:");
    eprintln!("  Single image detection:");
    eprintln!("    {prog} --model <dir> --image <path> [--conf <float>] [--nms <float>]\n");
    eprintln!("  Multi-frame tracking:");
    eprintln!("    {prog} --model <dir> --track [options]");
    eprintln!("    (reads image paths from stdin, one per line, or from --images-file)\n");
    eprintln!("Options:");
    eprintln!("  --model <dir>        Directory containing scrfd.param and scrfd.bin");
    eprintln!("  --image <path>       Single image path (detection mode)");
    eprintln!("  --track              Enable tracking mode (reads paths from stdin)");
    eprintln!("  --images-file <path> File containing image paths, one per line");
    eprintln!("  --conf <float>       Confidence threshold (default: 0.5)");
    eprintln!("  --nms <float>        NMS IoU threshold (default: 0.4)");
    eprintln!("  --iou <float>        Tracking IoU threshold (default: 0.15)");
    eprintln!("  --detection-fps <f>  Detection sampling rate (default: 5.0)");
    eprintln!("  --video-fps <float>  Source video FPS (default: 30.0)");
    eprintln!("  --reid-model <dir>   Optional dir containing mobilefacenet-*.param/.bin");
    eprintln!("  --reid-weight <f>    Appearance weight (default: 0.35)");
    eprintln!("  --reid-cos <f>       Appearance cosine gate threshold (default: 0.35)");
    eprintln!("  --test-ocsort        Run a deterministic OC-SORT self-test");
    eprintln!("\nOutput: JSON to stdout");
    eprintln!("\nExit codes:");
    eprintln!("  0 - Success");
    eprintln!("  1 - Invalid arguments");
    eprintln!("  2 - Model files not found");
    eprintln!("  3 - Image load failed");
    eprintln!("  4 - Inference error");
    eprintln!("  5 - No input provided");
    eprintln!("  6 - Self-test failed");
}

fn parse_args(argv: &[String]) -> Option<Args> {
    let mut args = Args::default();
    let mut i = 1;

    let parse_f32 = |v: &str| v.parse::<f32>().ok();

    while i < argv.len() {
        let arg = argv[i].as_str();
        let value = argv.get(i + 1);
        match arg {
            "--model" => {
                args.model_dir = value?.clone();
                i += 1;
            }
            "--image" => {
                args.image_path = value?.clone();
                i += 1;
            }
            "--track" => args.track_mode = true,
            "--test-ocsort" => args.test_ocsort = true,
            "--images-file" => {
                args.images_file = value?.clone();
                args.track_mode = true;
                i += 1;
            }
            "--conf" => {
                args.conf_thresh = parse_f32(value?)?;
                i += 1;
            }
            "--nms" => {
                args.nms_thresh = parse_f32(value?)?;
                i += 1;
            }
            "--iou" => {
                args.iou_thresh = parse_f32(value?)?;
                i += 1;
            }
            "--detection-fps" => {
                args.detection_fps = parse_f32(value?)?;
                i += 1;
            }
            "--video-fps" => {
                args.video_fps = parse_f32(value?)?;
                i += 1;
            }
            "--reid-model" => {
                args.reid_model_dir = value?.clone();
                i += 1;
            }
            "--reid-weight" => {
                args.reid_weight = parse_f32(value?)?;
                i += 1;
            }
            "--reid-cos" => {
                args.reid_cos_thresh = parse_f32(value?)?;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage(&argv[0]);
                exit(EXIT_SUCCESS);
            }
            other => {
                eprintln!("Error: unknown argument {other}\n");
                return None;
            }
        }
        i += 1;
    }

    Some(args)
}

fn read_paths_from_stdin() -> Vec<String> {
    std::io::stdin()
        .lock()
        .lines()
        .map_while(|line| line.ok())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn read_paths_from_file(path: &str) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        Err(e) => {
            eprintln!("Error: failed to read {path}: {e}");
            Vec::new()
        }
    }
}

fn run_detection(args: &Args) -> i32 {
    let mut detector = match ScrfdDetector::new(&args.model_dir, args.conf_thresh, args.nms_thresh)
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_MODEL_NOT_FOUND;
        }
    };

    let image = match ImageData::from_file(&args.image_path) {
        Ok(img) => img,
        Err(e) => {
            eprintln!("Error: failed to load image {}: {e}", args.image_path);
            return EXIT_IMAGE_LOAD_FAILED;
        }
    };

    let faces = match detector.detect(&image) {
        Ok(faces) => faces,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_INFERENCE_FAILED;
        }
    };

    let report = ImageReport {
        image: args.image_path.clone(),
        width: image.width,
        height: image.height,
        faces: faces
            .into_iter()
            .map(|f| FaceRecord {
                bbox: f.bbox,
                confidence: f.score,
                landmarks: f.landmarks.map(|l| l.to_vec()).unwrap_or_default(),
            })
            .collect(),
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{json}");
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_INFERENCE_FAILED
        }
    }
}

fn run_tracking(args: &Args, image_paths: Vec<String>) -> i32 {
    if image_paths.is_empty() {
        eprintln!("Error: No image paths provided");
        return EXIT_NO_INPUT;
    }

    let detector = match ScrfdDetector::new(&args.model_dir, args.conf_thresh, args.nms_thresh) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_MODEL_NOT_FOUND;
        }
    };

    let cfg = PipelineConfig {
        conf_thresh: args.conf_thresh,
        nms_thresh: args.nms_thresh,
        iou_thresh: args.iou_thresh,
        detection_fps: args.detection_fps,
        reid_weight: args.reid_weight,
        reid_cos_thresh: args.reid_cos_thresh,
    };

    let mut pipeline = FacePipeline::new(Box::new(detector), cfg);
    if !args.reid_model_dir.is_empty() {
        match MobileFaceNetEmbedder::new(&args.reid_model_dir) {
            Ok(embedder) => {
                pipeline = pipeline.with_embedder(EmbeddingExtractor::new(
                    Box::new(embedder),
                    EmbeddingConfig::default(),
                ));
            }
            Err(e) => {
                log::warn!("appearance disabled: {e}");
            }
        }
    }

    let report = match pipeline.process_paths(&image_paths, args.video_fps) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_INFERENCE_FAILED;
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{json}");
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_INFERENCE_FAILED
        }
    }
}

fn run_self_test() -> i32 {
    match octrack::selftest::run_oru_self_test() {
        Ok(()) => {
            eprintln!("OC-SORT self-test passed");
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("OC-SORT self-test failed: {e}");
            EXIT_SELF_TEST_FAILED
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let argv: Vec<String> = std::env::args().collect();
    let Some(args) = parse_args(&argv) else {
        print_usage(&argv[0]);
        exit(EXIT_INVALID_ARGS);
    };

    if args.test_ocsort {
        exit(run_self_test());
    }

    if args.model_dir.is_empty() {
        eprintln!("Error: --model is required\n");
        print_usage(&argv[0]);
        exit(EXIT_INVALID_ARGS);
    }

    let code = if args.track_mode {
        let image_paths = if !args.images_file.is_empty() {
            read_paths_from_file(&args.images_file)
        } else {
            read_paths_from_stdin()
        };
        run_tracking(&args, image_paths)
    } else if !args.image_path.is_empty() {
        run_detection(&args)
    } else {
        eprintln!("Error: Either --image or --track is required\n");
        print_usage(&argv[0]);
        EXIT_INVALID_ARGS
    };

    exit(code);
}
