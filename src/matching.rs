//! Batch assignment strategies.
//!
//! A batch is a score matrix: one row per task, one column per resource
//! slot, `None` where the pair is infeasible. A [`Matcher`] assigns each row
//! at most one column and each column at most one row.
//!
//! - [`ExactMatcher`] solves the assignment problem with the Hungarian
//!   (Kuhn–Munkres) algorithm, O(rows² · cols). It first maximizes the number
//!   of assigned tasks, then the total score.
//! - [`GreedyMatcher`] takes the highest-scoring free pair first. It is an
//!   approximation: the total score can be lower than the optimum.

/// Row-major matrix of optional scores; higher is better.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Option<f64>>,
}

impl ScoreMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![None; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.cells[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, score: f64) {
        self.cells[row * self.cols + col] = Some(score);
    }

    /// Total score of an assignment.
    pub fn total(&self, assignment: &[Option<usize>]) -> f64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(row, col)| col.and_then(|c| self.get(row, c)))
            .sum()
    }

    fn feasible_cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.rows).flat_map(move |r| {
            (0..self.cols).filter_map(move |c| self.get(r, c).map(|s| (r, c, s)))
        })
    }
}

/// Strategy that turns a score matrix into an assignment.
pub trait Matcher: Send + Sync {
    /// For every row, the assigned column or `None`.
    fn assign(&self, scores: &ScoreMatrix) -> Vec<Option<usize>>;

    /// Whether the result is guaranteed optimal.
    fn is_exact(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyMatcher;

impl Matcher for GreedyMatcher {
    fn assign(&self, scores: &ScoreMatrix) -> Vec<Option<usize>> {
        let mut cells: Vec<_> = scores.feasible_cells().collect();
        cells.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| a.0.cmp(&b.0))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut assignment = vec![None; scores.rows()];
        let mut taken = vec![false; scores.cols()];
        for (row, col, _) in cells {
            if assignment[row].is_none() && !taken[col] {
                assignment[row] = Some(col);
                taken[col] = true;
            }
        }
        assignment
    }

    fn is_exact(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl Matcher for ExactMatcher {
    fn assign(&self, scores: &ScoreMatrix) -> Vec<Option<usize>> {
        let n = scores.rows();
        if n == 0 {
            return Vec::new();
        }
        let feasible: Vec<_> = scores.feasible_cells().collect();
        if feasible.is_empty() {
            return vec![None; n];
        }

        // Minimization form: cost = best - score for feasible cells, and a
        // forbidden cost larger than any sum of feasible costs otherwise.
        let best = feasible.iter().map(|c| c.2).fold(f64::MIN, f64::max);
        let worst = feasible.iter().map(|c| c.2).fold(f64::MAX, f64::min);
        let forbidden = (best - worst + 1.0) * (n as f64 + 1.0);

        // Pad with forbidden columns so every row can be matched.
        let m = scores.cols().max(n);
        let cost = |i: usize, j: usize| -> f64 {
            if j < scores.cols() {
                scores.get(i, j).map_or(forbidden, |s| best - s)
            } else {
                forbidden
            }
        };

        // 1-indexed potentials; p[j] is the row matched to column j.
        let mut u = vec![0.0f64; n + 1];
        let mut v = vec![0.0f64; m + 1];
        let mut p = vec![0usize; m + 1];
        let mut way = vec![0usize; m + 1];

        for i in 1..=n {
            p[0] = i;
            let mut j0 = 0;
            let mut minv = vec![f64::INFINITY; m + 1];
            let mut used = vec![false; m + 1];
            loop {
                used[j0] = true;
                let i0 = p[j0];
                let mut delta = f64::INFINITY;
                let mut j1 = 0;
                for j in 1..=m {
                    if used[j] {
                        continue;
                    }
                    let cur = cost(i0 - 1, j - 1) - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
                for j in 0..=m {
                    if used[j] {
                        u[p[j]] += delta;
                        v[j] -= delta;
                    } else {
                        minv[j] -= delta;
                    }
                }
                j0 = j1;
                if p[j0] == 0 {
                    break;
                }
            }
            loop {
                let j1 = way[j0];
                p[j0] = p[j1];
                j0 = j1;
                if j0 == 0 {
                    break;
                }
            }
        }

        let mut assignment = vec![None; n];
        for j in 1..=m {
            let row = p[j];
            if row == 0 {
                continue;
            }
            let col = j - 1;
            if col < scores.cols() && scores.get(row - 1, col).is_some() {
                assignment[row - 1] = Some(col);
            }
        }
        assignment
    }

    fn is_exact(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&[Option<f64>]]) -> ScoreMatrix {
        let mut m = ScoreMatrix::new(rows.len(), rows[0].len());
        for (r, row) in rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if let Some(s) = cell {
                    m.set(r, c, *s);
                }
            }
        }
        m
    }

    #[test]
    fn test_exact_beats_greedy_on_total_score() {
        // Greedy takes (0,0)=0.9 and leaves row 1 with 0.1; optimum is 0.8 + 0.8.
        let scores = matrix(&[&[Some(0.9), Some(0.8)], &[Some(0.8), Some(0.1)]]);
        let greedy = GreedyMatcher.assign(&scores);
        let exact = ExactMatcher.assign(&scores);
        assert_eq!(greedy, vec![Some(0), Some(1)]);
        assert_eq!(exact, vec![Some(1), Some(0)]);
        assert!(scores.total(&exact) > scores.total(&greedy));
    }

    #[test]
    fn test_exact_maximizes_assigned_rows_first() {
        // Row 0 could take column 0 with a high score, but only row 0 can use column 1.
        let scores = matrix(&[&[Some(1.0), Some(0.1)], &[Some(0.2), None]]);
        let exact = ExactMatcher.assign(&scores);
        assert_eq!(exact, vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_more_rows_than_columns() {
        let scores = matrix(&[&[Some(0.5)], &[Some(0.7)], &[None]]);
        let exact = ExactMatcher.assign(&scores);
        assert_eq!(exact, vec![None, Some(0), None]);
        let greedy = GreedyMatcher.assign(&scores);
        assert_eq!(greedy, vec![None, Some(0), None]);
    }

    #[test]
    fn test_all_infeasible() {
        let scores = ScoreMatrix::new(2, 3);
        assert_eq!(ExactMatcher.assign(&scores), vec![None, None]);
        assert_eq!(GreedyMatcher.assign(&scores), vec![None, None]);
    }

    #[test]
    fn test_exact_matches_brute_force_on_small_matrix() {
        let raw = [
            [0.3, 0.9, 0.4, 0.2],
            [0.8, 0.7, 0.1, 0.6],
            [0.5, 0.2, 0.95, 0.4],
        ];
        let mut scores = ScoreMatrix::new(3, 4);
        for (r, row) in raw.iter().enumerate() {
            for (c, s) in row.iter().enumerate() {
                scores.set(r, c, *s);
            }
        }
        let mut best = f64::MIN;
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    if a != b && b != c && a != c {
                        best = best.max(raw[0][a] + raw[1][b] + raw[2][c]);
                    }
                }
            }
        }
        let exact = ExactMatcher.assign(&scores);
        assert!((scores.total(&exact) - best).abs() < 1e-9);
    }
}
