//! Initial atom placement: FCC lattice or uniform random fill

use std::collections::HashMap;
use std::f64::consts::PI;

use rand::Rng;
use tracing::debug;

use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::error::{SotlError, SotlResult};
use crate::params::{ATOM_RADIUS, LATTICE_TILE};

/// Lattice tiles along x/y and z for `natoms` atoms, four per FCC cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiles {
    pub xy: usize,
    pub z: usize,
}

impl Tiles {
    pub fn for_atoms(natoms: usize) -> Self {
        let xy = ((natoms as f64 / 4.0).cbrt() as usize).max(1);
        let z = natoms.div_ceil(4 * xy * xy);
        Self { xy, z }
    }

    /// Random fills use twice as many tiles, on every axis
    pub fn randomized(self) -> Self {
        Self {
            xy: self.xy * 2,
            z: self.xy * 2,
        }
    }

    /// Domain bounds covering the tiles
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let extent = |tiles: usize| tiles as f32 * LATTICE_TILE - LATTICE_TILE * 0.5;
        ([0.0; 3], [extent(self.xy), extent(self.xy), extent(self.z)])
    }
}

/// Random velocity with speed in `[0.05, 0.2]` atom radii and a uniformly
/// drawn latitude and longitude
pub fn random_velocity<R: Rng + ?Sized>(rng: &mut R) -> [f32; 3] {
    let radius = ATOM_RADIUS as f64;
    let speed = rng.gen_range(radius * 0.05..=radius * 0.2);
    let lat = rng.gen_range(-PI / 2.0..=PI / 2.0);
    let lon = rng.gen_range(0.0..2.0 * PI);
    [
        (lon.cos() * lat.cos() * speed) as f32,
        (lat.sin() * speed) as f32,
        (-lon.sin() * lat.cos() * speed) as f32,
    ]
}

/// Fill `atoms` with an FCC lattice at rest, stopping at `natoms`
pub fn fill_lattice(atoms: &mut AtomSet, tiles: Tiles) -> SotlResult<()> {
    let half = LATTICE_TILE / 2.0;
    let cell = [[0, 0, 0], [0, 1, 1], [1, 0, 1], [1, 1, 0]];
    for z in (0..2 * tiles.z).step_by(2) {
        for y in (0..2 * tiles.xy).step_by(2) {
            for x in (0..2 * tiles.xy).step_by(2) {
                for [dx, dy, dz] in cell {
                    if atoms.is_full() {
                        return Ok(());
                    }
                    let pos = [
                        (x + dx) as f32 * half,
                        (y + dy) as f32 * half,
                        (z + dz) as f32 * half,
                    ];
                    atoms.add(pos, [0.0; 3])?;
                }
            }
        }
    }
    Ok(())
}

/// Draws allowed per atom before [`fill_random`] gives up
const PLACEMENT_ATTEMPTS: usize = 64;

/// Fill `atoms` with uniformly placed atoms inside the domain interior.
///
/// Candidates closer than `min_gap` to an atom placed by this call are
/// drawn again.
pub fn fill_random<R: Rng + ?Sized>(
    atoms: &mut AtomSet,
    domain: &Domain,
    min_gap: f32,
    rng: &mut R,
) -> SotlResult<()> {
    let (min, max) = (domain.min_ext(), domain.max_ext());
    let wanted = atoms.natoms() - atoms.current();
    let gap2 = min_gap * min_gap;
    let cell = min_gap.max(f32::EPSILON);
    let cell_of = |p: [f32; 3]| [0, 1, 2].map(|k| ((p[k] - min[k]) / cell).floor() as i64);

    // placed atoms bucketed by cells one gap wide
    let mut cells: HashMap<[i64; 3], Vec<[f32; 3]>> = HashMap::new();
    let mut budget = PLACEMENT_ATTEMPTS * wanted;
    while !atoms.is_full() {
        if budget == 0 {
            return Err(SotlError::InvalidValue(format!(
                "could not place {wanted} atoms at least {min_gap} apart, {} placed",
                wanted - (atoms.natoms() - atoms.current())
            )));
        }
        budget -= 1;

        let pos = [
            rng.gen_range(min[0]..max[0]),
            rng.gen_range(min[1]..max[1]),
            rng.gen_range(min[2]..max[2]),
        ];
        let [cx, cy, cz] = cell_of(pos);
        let crowded = (-1..=1).any(|dz| {
            (-1..=1).any(|dy| {
                (-1..=1).any(|dx| {
                    cells.get(&[cx + dx, cy + dy, cz + dz]).is_some_and(|near| {
                        near.iter().any(|q| {
                            let d = [pos[0] - q[0], pos[1] - q[1], pos[2] - q[2]];
                            d[0] * d[0] + d[1] * d[1] + d[2] * d[2] < gap2
                        })
                    })
                })
            })
        });
        if crowded {
            continue;
        }
        cells.entry([cx, cy, cz]).or_default().push(pos);
        atoms.add(pos, random_velocity(rng))?;
    }
    debug!(natoms = wanted, min_gap, "atoms placed at random");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SimParams;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn tiles_cover_the_requested_atoms() {
        for natoms in [1, 3, 4, 100, 1000, 4000, 12345] {
            let t = Tiles::for_atoms(natoms);
            assert!(4 * t.xy * t.xy * t.z >= natoms, "{natoms}: {t:?}");
        }
        assert_eq!(Tiles::for_atoms(520), Tiles { xy: 5, z: 6 });
        assert_eq!(Tiles::for_atoms(520).randomized(), Tiles { xy: 10, z: 10 });
    }

    #[test]
    fn lattice_fills_exactly_and_stays_in_bounds() {
        let natoms = 1000;
        let tiles = Tiles::for_atoms(natoms);
        let (min, max) = tiles.bounds();
        let mut atoms = AtomSet::new(natoms).unwrap();
        fill_lattice(&mut atoms, tiles).unwrap();
        assert!(atoms.is_full());
        for i in 0..natoms {
            let p = atoms.position(i);
            for k in 0..3 {
                assert!(p[k] >= min[k] && p[k] <= max[k] + 1e-5, "{p:?}");
            }
        }
        // nearest FCC neighbours sit half a tile apart on two axes
        let d = atoms.position(1);
        assert_eq!(d, [0.0, 0.4, 0.4]);
    }

    #[test]
    fn random_velocity_stays_in_the_speed_band() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let v = random_velocity(&mut rng);
            let speed = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            assert!(speed >= ATOM_RADIUS * 0.05 - 1e-6);
            assert!(speed <= ATOM_RADIUS * 0.2 + 1e-6);
        }
    }

    #[test]
    fn random_fill_is_seeded() {
        let domain = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        let fill = |seed| {
            let mut atoms = AtomSet::new(50).unwrap();
            fill_random(&mut atoms, &domain, 0.3, &mut StdRng::seed_from_u64(seed)).unwrap();
            atoms
        };
        assert_eq!(fill(1), fill(1));
        assert_ne!(fill(1), fill(2));
        let atoms = fill(3);
        for i in 0..50 {
            let p = atoms.position(i);
            for k in 0..3 {
                assert!(p[k] >= domain.min_ext()[k] && p[k] < domain.max_ext()[k]);
            }
        }
    }

    #[test]
    fn random_fill_keeps_atoms_apart() {
        let sigma = SimParams::default().lj_sigma as f32;
        let (min, max) = Tiles::for_atoms(200).randomized().bounds();
        let domain = Domain::init(min, max, SimParams::default().lj_cutoff).unwrap();
        let mut atoms = AtomSet::new(200).unwrap();
        fill_random(&mut atoms, &domain, sigma, &mut StdRng::seed_from_u64(9)).unwrap();
        for i in 0..200 {
            for j in i + 1..200 {
                let (a, b) = (atoms.position(i), atoms.position(j));
                let d2: f32 = (0..3).map(|k| (a[k] - b[k]).powi(2)).sum();
                assert!(d2 >= sigma * sigma, "atoms {i} and {j} overlap");
            }
        }
    }

    #[test]
    fn random_fill_gives_up_when_crowded() {
        let domain = Domain::init([0.0; 3], [1.0; 3], 0.6).unwrap();
        let mut atoms = AtomSet::new(200).unwrap();
        let err = fill_random(&mut atoms, &domain, 1.0, &mut StdRng::seed_from_u64(4)).unwrap_err();
        assert!(matches!(err, SotlError::InvalidValue(_)), "{err}");
        assert!(!atoms.is_full());
    }
}
