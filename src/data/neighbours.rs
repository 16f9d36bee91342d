use super::DataError;
use std::collections::HashMap;

/// First- and second-order spatial neighbours on the voxel lattice, stored
/// as ragged index lists in dataset voxel order.
///
/// `spatial_dims` selects the active axes: 0 disables spatial coupling, 1
/// couples along x only, 2 in-slice (x,y), 3 the full volume.
#[derive(Debug, Clone)]
pub struct NeighbourGraph {
    first: Vec<Vec<usize>>,
    second: Vec<Vec<usize>>,
    spatial_dims: usize,
}

impl NeighbourGraph {
    pub fn build(coords: &[[i32; 3]], spatial_dims: usize) -> Result<Self, DataError> {
        if spatial_dims > 3 {
            return Err(DataError::InvalidFormat(format!(
                "spatial-dims must be 0..=3, got {}",
                spatial_dims
            )));
        }
        let n = coords.len();
        let index: HashMap<[i32; 3], usize> =
            coords.iter().enumerate().map(|(i, c)| (*c, i)).collect();

        let mut first = vec![Vec::new(); n];
        let mut second = vec![Vec::new(); n];

        let axes: &[usize] = match spatial_dims {
            0 => &[],
            1 => &[0],
            2 => &[0, 1],
            _ => &[0, 1, 2],
        };

        for (v, c) in coords.iter().enumerate() {
            // distance-1: unit steps along each active axis
            for &a in axes {
                for step in [-1, 1] {
                    let mut nc = *c;
                    nc[a] += step;
                    if let Some(&u) = index.get(&nc) {
                        first[v].push(u);
                    }
                }
            }
            // distance-2: two steps along one axis, or one step along each of
            // two distinct axes
            for &a in axes {
                for step in [-2, 2] {
                    let mut nc = *c;
                    nc[a] += step;
                    if let Some(&u) = index.get(&nc) {
                        second[v].push(u);
                    }
                }
            }
            for (i, &a) in axes.iter().enumerate() {
                for &b in &axes[i + 1..] {
                    for sa in [-1, 1] {
                        for sb in [-1, 1] {
                            let mut nc = *c;
                            nc[a] += sa;
                            nc[b] += sb;
                            if let Some(&u) = index.get(&nc) {
                                second[v].push(u);
                            }
                        }
                    }
                }
            }
            first[v].sort_unstable();
            second[v].sort_unstable();
        }

        Ok(Self {
            first,
            second,
            spatial_dims,
        })
    }

    pub fn n_voxels(&self) -> usize {
        self.first.len()
    }

    pub fn spatial_dims(&self) -> usize {
        self.spatial_dims
    }

    pub fn first_order(&self, voxel: usize) -> &[usize] {
        &self.first[voxel]
    }

    pub fn second_order(&self, voxel: usize) -> &[usize] {
        &self.second[voxel]
    }

    /// Neighbour count an interior lattice voxel would have; used by the
    /// Dirichlet-boundary spatial prior in place of the true count at edges.
    pub fn interior_count(&self) -> usize {
        2 * self.spatial_dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_coords(n: i32) -> Vec<[i32; 3]> {
        (0..n).map(|x| [x, 0, 0]).collect()
    }

    #[test]
    fn test_line_first_order() {
        let g = NeighbourGraph::build(&line_coords(4), 1).unwrap();
        assert_eq!(g.first_order(0), &[1]);
        assert_eq!(g.first_order(1), &[0, 2]);
        assert_eq!(g.first_order(3), &[2]);
        assert_eq!(g.interior_count(), 2);
    }

    #[test]
    fn test_line_second_order() {
        let g = NeighbourGraph::build(&line_coords(5), 1).unwrap();
        assert_eq!(g.second_order(2), &[0, 4]);
        assert_eq!(g.second_order(0), &[2]);
    }

    #[test]
    fn test_spatial_dims_zero_disables() {
        let g = NeighbourGraph::build(&line_coords(3), 0).unwrap();
        for v in 0..3 {
            assert!(g.first_order(v).is_empty());
            assert!(g.second_order(v).is_empty());
        }
    }

    #[test]
    fn test_plane_diagonal_second_order() {
        let coords = vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]];
        let g = NeighbourGraph::build(&coords, 2).unwrap();
        assert_eq!(g.first_order(0), &[1, 2]);
        assert_eq!(g.second_order(0), &[3]);
    }

    #[test]
    fn test_symmetry() {
        let coords: Vec<[i32; 3]> = (0..3)
            .flat_map(|x| (0..3).flat_map(move |y| (0..2).map(move |z| [x, y, z])))
            .collect();
        let g = NeighbourGraph::build(&coords, 3).unwrap();
        for v in 0..coords.len() {
            for &u in g.first_order(v) {
                assert!(g.first_order(u).contains(&v));
            }
            for &u in g.second_order(v) {
                assert!(g.second_order(u).contains(&v));
            }
        }
    }

    #[test]
    fn test_in_slice_only() {
        let coords = vec![[0, 0, 0], [0, 0, 1]];
        let g = NeighbourGraph::build(&coords, 2).unwrap();
        assert!(g.first_order(0).is_empty());
        let g3 = NeighbourGraph::build(&coords, 3).unwrap();
        assert_eq!(g3.first_order(0), &[1]);
    }
}
