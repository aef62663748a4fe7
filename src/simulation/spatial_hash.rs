//! Uniform grid neighbor index, rebuilt from scratch every step.
//!
//! Cells live in one flat, pre-sized array covering the container. Positions outside the
//! covered area are clamped into the border cells, which keeps every query a superset of the
//! true neighborhood.

use crate::{floating_type_mod::FT, V, V2};

type VI = V<i32, 2>;

#[derive(Debug, Clone, Default)]
struct Cell {
    particle_ids: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialHashStats {
    pub cell_count: usize,
    pub occupied_cells: usize,
    pub particle_count: usize,
    pub max_bucket: usize,
    /// mean bucket size over occupied cells
    pub avg_bucket: FT,
}

#[derive(Debug, Clone)]
pub struct SpatialHashGrid {
    cell_size: FT,
    grid_min: VI,
    size: V<usize, 2>,
    cells: Vec<Cell>,
    particle_count: usize,
}

impl SpatialHashGrid {
    /// Grid over the square `[-half_extent, half_extent]^2`.
    pub fn new(cell_size: FT, half_extent: FT) -> Self {
        assert!(cell_size > 0., "cell size must be positive");
        let cells_per_side = (half_extent / cell_size).ceil().max(1.) as i32;
        let grid_min = VI::new(-cells_per_side, -cells_per_side);
        let size = V::<usize, 2>::new(2 * cells_per_side as usize, 2 * cells_per_side as usize);
        SpatialHashGrid {
            cell_size,
            grid_min,
            size,
            cells: vec![Cell::default(); size.x * size.y],
            particle_count: 0,
        }
    }

    pub fn particle_count(&self) -> usize {
        self.particle_count
    }

    fn particle_to_cell_pos(&self, x: FT, y: FT) -> VI {
        VI::new((x / self.cell_size).floor() as i32, (y / self.cell_size).floor() as i32)
    }

    fn clamp_cell_pos(&self, cell_pos: VI) -> VI {
        VI::new(
            cell_pos.x.clamp(self.grid_min.x, self.grid_min.x + self.size.x as i32 - 1),
            cell_pos.y.clamp(self.grid_min.y, self.grid_min.y + self.size.y as i32 - 1),
        )
    }

    fn pos_to_idx(&self, cell_pos: VI) -> usize {
        let local = cell_pos - self.grid_min;
        local.y as usize * self.size.x + local.x as usize
    }

    /// Empties every bucket. The bucket allocations are kept.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.particle_ids.clear();
        }
        self.particle_count = 0;
    }

    pub fn insert(&mut self, index: usize, x: FT, y: FT) {
        let cell_pos = self.clamp_cell_pos(self.particle_to_cell_pos(x, y));
        let idx = self.pos_to_idx(cell_pos);
        self.cells[idx].particle_ids.push(index);
        self.particle_count += 1;
    }

    /// Clears the grid and inserts every position under its slice index.
    pub fn rebuild(&mut self, positions: &[V2]) {
        self.clear();
        for (i, p) in positions.iter().enumerate() {
            self.insert(i, p.x, p.y);
        }
    }

    /// Calls `f` for every particle in the `ceil(radius / cell_size)` ring of cells around `(x, y)`.
    ///
    /// Candidates are not distance filtered. The query center is clamped like an inserted
    /// position and the ring never exceeds the grid side, so far away points and huge radii
    /// stay in range.
    #[inline]
    pub fn for_each_candidate(&self, x: FT, y: FT, radius: FT, mut f: impl FnMut(usize)) {
        let max_ring = self.size.x.max(self.size.y) as i32;
        let ring = ((radius / self.cell_size).ceil().max(0.) as i32).min(max_ring);
        let center = self.clamp_cell_pos(self.particle_to_cell_pos(x, y));
        let lo = self.clamp_cell_pos(center - VI::new(ring, ring));
        let hi = self.clamp_cell_pos(center + VI::new(ring, ring));

        for cy in lo.y..=hi.y {
            for cx in lo.x..=hi.x {
                let idx = self.pos_to_idx(VI::new(cx, cy));
                for &j in &self.cells[idx].particle_ids {
                    f(j);
                }
            }
        }
    }

    /// Same as [`Self::query`] but reuses `out`.
    pub fn query_into(&self, x: FT, y: FT, radius: FT, out: &mut Vec<usize>) {
        out.clear();
        self.for_each_candidate(x, y, radius, |j| out.push(j));
    }

    pub fn query(&self, x: FT, y: FT, radius: FT) -> Vec<usize> {
        let mut out = Vec::new();
        self.query_into(x, y, radius, &mut out);
        out
    }

    pub fn stats(&self) -> SpatialHashStats {
        let mut occupied_cells = 0;
        let mut max_bucket = 0;
        for cell in &self.cells {
            let len = cell.particle_ids.len();
            if len > 0 {
                occupied_cells += 1;
                max_bucket = max_bucket.max(len);
            }
        }
        SpatialHashStats {
            cell_count: self.cells.len(),
            occupied_cells,
            particle_count: self.particle_count,
            max_bucket,
            avg_bucket: if occupied_cells > 0 {
                self.particle_count as FT / occupied_cells as FT
            } else {
                0.
            },
        }
    }
}

#[cfg(test)]
fn random_disk(n: usize, radius: FT, seed: u64) -> Vec<V2> {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let r = radius * rng.gen::<FT>().sqrt();
            let phi = rng.gen_range(0. ..crate::floating_type_mod::TAU);
            crate::vec2f(r * phi.cos(), r * phi.sin())
        })
        .collect()
}

#[cfg(test)]
fn assert_filtered_query_matches_brute_force(grid: &SpatialHashGrid, positions: &[V2], radius: FT) {
    for (i, p) in positions.iter().enumerate() {
        let mut found: Vec<usize> = grid
            .query(p.x, p.y, radius)
            .into_iter()
            .filter(|&j| (positions[j] - p).norm() <= radius)
            .collect();
        found.sort_unstable();

        let expected: Vec<usize> = (0..positions.len())
            .filter(|&j| (positions[j] - p).norm() <= radius)
            .collect();

        assert_eq!(found, expected, "neighborhood of particle {} at {:?}", i, p);
    }
}

#[test]
fn query_is_superset_of_brute_force_neighbors() {
    let h = 0.05;
    let positions = random_disk(400, 1., 7);
    let mut grid = SpatialHashGrid::new(2. * h, 1. + 2. * h);
    grid.rebuild(&positions);

    assert_filtered_query_matches_brute_force(&grid, &positions, h);
    assert_filtered_query_matches_brute_force(&grid, &positions, 2. * h);
    assert_filtered_query_matches_brute_force(&grid, &positions, 0.3);
}

#[test]
fn particles_outside_the_grid_are_still_found() {
    let mut grid = SpatialHashGrid::new(0.1, 0.5);
    let positions = vec![crate::vec2f(3., 3.), crate::vec2f(3.05, 3.), crate::vec2f(-7., 0.2), crate::vec2f(0., 0.)];
    grid.rebuild(&positions);

    assert_eq!(grid.particle_count(), 4);
    assert_filtered_query_matches_brute_force(&grid, &positions, 0.1);
    assert!(grid.query(3., 3., 0.1).contains(&1));
}

#[test]
fn every_particle_lands_in_exactly_one_bucket() {
    let positions = random_disk(250, 1., 3);
    let mut grid = SpatialHashGrid::new(0.125, 1.);
    grid.rebuild(&positions);

    let mut seen = vec![0; positions.len()];
    for cell in &grid.cells {
        for &i in &cell.particle_ids {
            seen[i] += 1;
        }
    }
    assert!(seen.iter().all(|&n| n == 1));

    let stats = grid.stats();
    assert_eq!(stats.particle_count, 250);
    assert_eq!(stats.cell_count, 16 * 16);
    assert!(stats.occupied_cells > 0 && stats.occupied_cells <= stats.cell_count);
    assert!(stats.max_bucket as FT >= stats.avg_bucket);
}

#[test]
fn clear_resets_all_buckets() {
    let mut grid = SpatialHashGrid::new(0.1, 1.);
    grid.insert(0, 0.2, 0.3);
    grid.insert(1, 0.25, 0.3);
    assert_eq!(grid.query(0.2, 0.3, 0.05).len(), 2);

    grid.clear();
    assert!(grid.query(0.2, 0.3, 0.5).is_empty());
    let stats = grid.stats();
    assert_eq!(stats.occupied_cells, 0);
    assert_eq!(stats.avg_bucket, 0.);
}

#[test]
fn far_away_points_and_huge_radii_are_clamped() {
    let mut grid = SpatialHashGrid::new(0.1, 0.5);
    let positions = vec![
        crate::vec2f(0.45, 0.),
        crate::vec2f(1e12, 0.),
        crate::vec2f(-0.45, 0.02),
        crate::vec2f(0., 0.),
    ];
    grid.rebuild(&positions);

    let right = grid.query(1e12, 0., 0.1);
    assert!(right.contains(&0) && right.contains(&1));
    assert!(grid.query(-1e12, 0., 0.1).contains(&2));

    let mut all = grid.query(0.15, 0., 1e12);
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3]);
    assert_eq!(grid.query(0.15, 0., FT::INFINITY).len(), 4);
    assert_filtered_query_matches_brute_force(&grid, &positions, 0.1);
}

#[cfg(test)]
proptest::proptest! {
    #[test]
    fn filtered_query_matches_brute_force_on_random_disks(
        polar in proptest::collection::vec((0.0f32..1.0, 0.0f32..crate::floating_type_mod::TAU), 1..150),
        radius in 0.01f32..0.4,
    ) {
        let positions: Vec<V2> = polar
            .iter()
            .map(|&(r, phi)| crate::vec2f(r.sqrt() * phi.cos(), r.sqrt() * phi.sin()))
            .collect();
        let mut grid = SpatialHashGrid::new(0.1, 1.1);
        grid.rebuild(&positions);
        assert_filtered_query_matches_brute_force(&grid, &positions, radius);
    }
}
