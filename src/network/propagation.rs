//! Decides which backward layers have to forward a gradient to their
//! predecessors.
//!
//! Gradient is only useful where it can reach a learnable parameter. Layers
//! that sit on weight-free paths from the input layer never need to pass a
//! gradient on, so their backward stages act as sinks.

/// Computes the gradient-propagation flag of every layer.
///
/// `next_layers[i]` lists the forward successors of layer `i`; layer 0 is the
/// input. `has_weights[i]` tells whether layer `i` owns weights or biases.
///
/// Two depth-first walks from layer 0:
/// 1. every layer reachable without expanding past a weighted layer is
///    switched off (the weighted frontier layers included);
/// 2. a second walk over the switched-off region switches each weighted
///    frontier layer back on, together with everything downstream of it.
///
/// Layers not reachable from layer 0 keep the default `true`.
pub fn gradient_propagation_flags(next_layers: &[Vec<usize>], has_weights: &[bool]) -> Vec<bool> {
    let count = next_layers.len();
    let mut flags = vec![true; count];
    if count == 0 {
        return flags;
    }

    let mut visited = vec![false; count];
    let mut stack = vec![0];
    while let Some(layer) = stack.pop() {
        if visited[layer] {
            continue;
        }
        visited[layer] = true;
        flags[layer] = false;
        if has_weights[layer] {
            continue;
        }
        push_unvisited(&mut stack, &next_layers[layer], &visited);
    }

    let mut visited = vec![false; count];
    let mut stack = vec![0];
    while let Some(layer) = stack.pop() {
        if visited[layer] {
            continue;
        }
        visited[layer] = true;
        if flags[layer] {
            continue;
        }
        if has_weights[layer] {
            flags[layer] = true;
            enable_downstream(layer, next_layers, &mut flags, &mut visited);
            continue;
        }
        push_unvisited(&mut stack, &next_layers[layer], &visited);
    }
    flags
}

fn push_unvisited(stack: &mut Vec<usize>, next: &[usize], visited: &[bool]) {
    // reversed so that the first edge is expanded first
    stack.extend(next.iter().rev().filter(|&&n| !visited[n]));
}

/// Switches on every layer reachable from `start` and marks it visited for
/// the outer walk. Uses its own visited set: a layer already seen by the outer
/// walk may still lie downstream of `start`.
fn enable_downstream(start: usize, next_layers: &[Vec<usize>], flags: &mut [bool], visited: &mut [bool]) {
    let mut seen = vec![false; next_layers.len()];
    seen[start] = true;
    let mut stack: Vec<usize> = next_layers[start].iter().rev().copied().collect();
    while let Some(layer) = stack.pop() {
        if seen[layer] {
            continue;
        }
        seen[layer] = true;
        flags[layer] = true;
        visited[layer] = true;
        stack.extend(next_layers[layer].iter().rev().filter(|&&n| !seen[n]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Closed form: true iff some path 0 -> layer (inclusive) has a weighted layer.
    fn reference(next_layers: &[Vec<usize>], has_weights: &[bool]) -> Vec<bool> {
        let n = next_layers.len();
        let mut covered = vec![false; n];
        // indices are topologically ordered in every graph used here
        let mut reached = vec![false; n];
        reached[0] = true;
        covered[0] = has_weights[0];
        for i in 0..n {
            if !reached[i] {
                continue;
            }
            for &j in &next_layers[i] {
                reached[j] = true;
                covered[j] = covered[j] || covered[i] || has_weights[j];
            }
        }
        (0..n).map(|i| !reached[i] || covered[i]).collect()
    }

    #[test]
    fn test_chain() {
        // Input -> A(w) -> B -> C(w) -> D
        let next = vec![vec![1], vec![2], vec![3], vec![4], vec![]];
        let weights = [false, true, false, true, false];
        assert_eq!(gradient_propagation_flags(&next, &weights), vec![false, true, true, true, true]);
    }

    #[test]
    fn test_no_weighted_layers() {
        let next = vec![vec![1], vec![2], vec![]];
        assert_eq!(gradient_propagation_flags(&next, &[false; 3]), vec![false; 3]);
    }

    #[test]
    fn test_weighted_input_layer() {
        let next = vec![vec![1], vec![]];
        assert_eq!(gradient_propagation_flags(&next, &[true, false]), vec![true, true]);
    }

    #[test]
    fn test_diamond_with_bypass() {
        // 0 -> 1 -> 2(w) -> 3 ; 0 -> 3 (bypass reaches 3 before the weighted layer)
        let next = vec![vec![3, 1], vec![2], vec![3], vec![]];
        let weights = [false, false, true, false];
        let flags = gradient_propagation_flags(&next, &weights);
        assert_eq!(flags, vec![false, false, true, true]);
        assert_eq!(flags, reference(&next, &weights));
    }

    #[test]
    fn test_weighted_layers_at_different_depths() {
        // 0 -> 1(w) -> 3 -> 5 ; 0 -> 2 -> 4(w) -> 5 ; 0 -> 6 -> 5 ; 2 -> 7
        let next = vec![
            vec![1, 2, 6],
            vec![3],
            vec![4, 7],
            vec![5],
            vec![5],
            vec![],
            vec![5],
            vec![],
        ];
        let weights = [false, true, false, false, true, false, false, false];
        let flags = gradient_propagation_flags(&next, &weights);
        assert_eq!(flags, reference(&next, &weights));
        assert_eq!(flags, vec![false, true, false, true, true, true, false, false]);
    }

    #[test]
    fn test_matches_reference_on_layered_graphs() {
        // every DAG over 5 layers where layer i may feed i+1 and i+2
        for mask in 0u32..(1 << 7) {
            let mut next = vec![Vec::new(); 5];
            let mut bit = 0;
            for i in 0..4 {
                next[i].push(i + 1);
                if i + 2 < 5 {
                    if mask & (1 << bit) != 0 {
                        next[i].push(i + 2);
                    }
                    bit += 1;
                }
            }
            let weights: Vec<bool> = (0..5).map(|i| i > 0 && ((mask >> (3 + i % 4)) & 1) == 1).collect();
            assert_eq!(
                gradient_propagation_flags(&next, &weights),
                reference(&next, &weights),
                "mask {mask}"
            );
        }
    }
}
