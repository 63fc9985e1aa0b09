//! Structural checks shared by the task graph and device subgraphs.

use std::collections::VecDeque;

/// Kahn's algorithm over `edges`.
///
/// Returns a topological order of `0..num_nodes`, or the nodes that could not
/// be ordered because they sit on or behind a cycle.
pub(crate) fn topological_order(
    num_nodes: usize,
    edges: &[(usize, usize)],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree = vec![0usize; num_nodes];
    let mut adjacency = vec![Vec::new(); num_nodes];
    for &(from, to) in edges {
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: VecDeque<usize> = (0..num_nodes).filter(|&n| in_degree[n] == 0).collect();
    let mut order = Vec::with_capacity(num_nodes);

    while let Some(n) = ready.pop_front() {
        order.push(n);
        for &succ in &adjacency[n] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push_back(succ);
            }
        }
    }

    if order.len() == num_nodes {
        Ok(order)
    } else {
        Err((0..num_nodes).filter(|&n| in_degree[n] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diamond() {
        let order = topological_order(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]).unwrap();
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&3));
    }

    #[test]
    fn test_edges_in_any_order() {
        let order = topological_order(3, &[(2, 0), (1, 2)]).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_cycle_reports_members() {
        let stuck = topological_order(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]).unwrap_err();
        assert_eq!(stuck, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty() {
        assert_eq!(topological_order(0, &[]).unwrap(), Vec::<usize>::new());
    }
}
