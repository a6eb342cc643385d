/// Hungarian algorithm for optimal detection-to-track assignment.
///
/// Thin wrapper over the `pathfinding` Kuhn-Munkres solver working on a
/// rectangular real-valued cost matrix. Costs are scaled to integers; ties
/// resolve to the solver's first-found pivot, so callers must not rely on
/// tie order beyond total-cost optimality.
use ndarray::ArrayView2;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Fixed-point scale applied to costs before integer solving.
const COST_SCALE: f32 = 1_000_000.0;
/// Absolute cost bound; larger (or non-finite) entries are clamped here.
const COST_CLAMP: f32 = 1_000_000_000.0;

/// Result of the assignment solve.
#[derive(Debug, Clone)]
pub struct AssignmentResult {
    /// Assignments as (row, col) pairs, sorted by row. Exactly
    /// min(rows, cols) pairs for a non-empty matrix.
    pub assignments: Vec<(usize, usize)>,
    /// Rows left without a column.
    pub unassigned_rows: Vec<usize>,
    /// Columns left without a row.
    pub unassigned_cols: Vec<usize>,
    /// Sum of the original (unscaled) costs over the assignments.
    pub total_cost: f32,
}

impl AssignmentResult {
    /// Per-row assignment vector: entry `i` is the column assigned to row
    /// `i`, or `None` when the row is unassigned.
    pub fn row_assignment(&self, n_rows: usize) -> Vec<Option<usize>> {
        let mut out = vec![None; n_rows];
        for &(r, c) in &self.assignments {
            out[r] = Some(c);
        }
        out
    }
}

/// Assignment solver over real-valued cost matrices.
pub struct HungarianSolver;

impl HungarianSolver {
    /// Solve the rectangular assignment problem, minimizing total cost.
    ///
    /// Empty matrices (M=0 or N=0) return an empty assignment with cost 0.
    pub fn solve_min(cost: ArrayView2<f32>) -> AssignmentResult {
        let (n_rows, n_cols) = cost.dim();

        if n_rows == 0 || n_cols == 0 {
            return AssignmentResult {
                assignments: Vec::new(),
                unassigned_rows: (0..n_rows).collect(),
                unassigned_cols: (0..n_cols).collect(),
                total_cost: 0.0,
            };
        }

        // kuhn_munkres requires rows <= columns; solve the transpose when
        // the matrix is tall and map the result back.
        let transposed = n_rows > n_cols;
        let (rows, cols) = if transposed {
            (n_cols, n_rows)
        } else {
            (n_rows, n_cols)
        };

        let mut weights = Matrix::new(rows, cols, 0i64);
        for r in 0..rows {
            for c in 0..cols {
                let v = if transposed { cost[[c, r]] } else { cost[[r, c]] };
                weights[(r, c)] = (sanitize(v) * COST_SCALE) as i64;
            }
        }

        let (_, raw) = kuhn_munkres_min(&weights);

        let mut assignments: Vec<(usize, usize)> = raw
            .iter()
            .enumerate()
            .map(|(r, &c)| if transposed { (c, r) } else { (r, c) })
            .collect();
        assignments.sort_unstable();

        let mut row_used = vec![false; n_rows];
        let mut col_used = vec![false; n_cols];
        let mut total_cost = 0.0;
        for &(r, c) in &assignments {
            row_used[r] = true;
            col_used[c] = true;
            total_cost += cost[[r, c]];
        }

        AssignmentResult {
            assignments,
            unassigned_rows: (0..n_rows).filter(|&r| !row_used[r]).collect(),
            unassigned_cols: (0..n_cols).filter(|&c| !col_used[c]).collect(),
            total_cost,
        }
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_nan() {
        COST_CLAMP
    } else {
        v.clamp(-COST_CLAMP, COST_CLAMP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_square_diagonal_optimal() {
        let cost = array![[1.0, 2.0], [2.0, 1.0]];
        let result = HungarianSolver::solve_min(cost.view());
        assert_eq!(result.assignments, vec![(0, 0), (1, 1)]);
        assert_abs_diff_eq!(result.total_cost, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_square_anti_diagonal_optimal() {
        let cost = array![[10.0, 1.0], [1.0, 10.0]];
        let result = HungarianSolver::solve_min(cost.view());
        assert_eq!(result.assignments, vec![(0, 1), (1, 0)]);
        assert_abs_diff_eq!(result.total_cost, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_tall_matrix_leaves_row_unassigned() {
        let cost = array![[1.0, 9.0], [9.0, 1.0], [5.0, 5.0]];
        let result = HungarianSolver::solve_min(cost.view());
        assert_eq!(result.assignments.len(), 2);
        assert_eq!(result.unassigned_rows, vec![2]);
        assert!(result.unassigned_cols.is_empty());
        assert_abs_diff_eq!(result.total_cost, 2.0, epsilon = 1e-5);

        let rows = result.row_assignment(3);
        assert_eq!(rows, vec![Some(0), Some(1), None]);
    }

    #[test]
    fn test_wide_matrix_assigns_all_rows() {
        let cost = array![[3.0, 1.0, 7.0], [2.0, 8.0, 1.0]];
        let result = HungarianSolver::solve_min(cost.view());
        assert_eq!(result.assignments.len(), 2);
        assert!(result.unassigned_rows.is_empty());
        assert_eq!(result.unassigned_cols.len(), 1);
        assert_abs_diff_eq!(result.total_cost, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_matrices() {
        let empty_rows = ndarray::Array2::<f32>::zeros((0, 4));
        let result = HungarianSolver::solve_min(empty_rows.view());
        assert!(result.assignments.is_empty());
        assert_eq!(result.unassigned_cols.len(), 4);
        assert_abs_diff_eq!(result.total_cost, 0.0);

        let empty_cols = ndarray::Array2::<f32>::zeros((3, 0));
        let result = HungarianSolver::solve_min(empty_cols.view());
        assert!(result.assignments.is_empty());
        assert_eq!(result.unassigned_rows.len(), 3);
        assert_eq!(result.row_assignment(3), vec![None, None, None]);
    }

    #[test]
    fn test_optimal_against_all_permutations() {
        let cost = array![[4.0, 2.0, 8.0], [4.0, 3.0, 7.0], [3.0, 1.0, 6.0]];
        let result = HungarianSolver::solve_min(cost.view());

        let perms = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for perm in perms {
            let perm_cost: f32 = perm.iter().enumerate().map(|(r, &c)| cost[[r, c]]).sum();
            assert!(result.total_cost <= perm_cost + 1e-5);
        }
    }
}
