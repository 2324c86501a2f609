//! Atom config files: reading, writing and loading into an [`AtomSet`]
//!
//! The format is line oriented:
//!
//! ```text
//! 000000002
//! 0.000000 1.000000
//! 0.000000 1.000000
//! 0.000000 1.000000
//! 1
//! 0.100000 0.200000 0.300000
//! 0.000000 0.000000 0.000000
//! ...
//! ```
//!
//! The first line is the atom count, then one `min max` pair per axis, then a
//! flag telling whether every position line is followed by a velocity line.
//! Without velocities, random ones are drawn with
//! [`crate::generator::random_velocity`].

use std::fmt;
use std::fs;
use std::path::Path;

use rand::Rng;
use tracing::{debug, info};

use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::error::{SotlError, SotlResult};
use crate::generator::random_velocity;

/// One atom of a config file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomRecord {
    pub pos: [f32; 3],
    pub vel: [f32; 3],
}

/// Contents of a config or dump file
#[derive(Debug, Clone, PartialEq)]
pub struct AtomConfig {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub atoms: Vec<AtomRecord>,
}

/// Whitespace tokens of a file, each tagged with its 1-based line
struct Tokens<'a> {
    inner: Box<dyn Iterator<Item = (usize, &'a str)> + 'a>,
    line: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        let inner = text
            .lines()
            .enumerate()
            .flat_map(|(n, line)| line.split_whitespace().map(move |t| (n + 1, t)));
        Self {
            inner: Box::new(inner),
            line: 1,
        }
    }

    fn next<T: std::str::FromStr>(&mut self, what: &str) -> SotlResult<T> {
        let Some((line, token)) = self.inner.next() else {
            return Err(SotlError::Parse {
                line: self.line,
                message: format!("unexpected end of file, expected {what}"),
            });
        };
        self.line = line;
        token.parse().map_err(|_| SotlError::Parse {
            line,
            message: format!("expected {what}, found '{token}'"),
        })
    }

    fn triple(&mut self, what: &str) -> SotlResult<[f32; 3]> {
        let values: [f32; 3] = [self.next(what)?, self.next(what)?, self.next(what)?];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SotlError::Parse {
                line: self.line,
                message: format!("{what} must be finite, found {values:?}"),
            });
        }
        Ok(values)
    }
}

impl AtomConfig {
    /// Parse a config file, drawing missing velocities from `rng`
    pub fn parse<R: Rng + ?Sized>(text: &str, rng: &mut R) -> SotlResult<Self> {
        let mut tokens = Tokens::new(text);
        let natoms: usize = tokens.next("atom count")?;

        let mut min = [0.0f32; 3];
        let mut max = [0.0f32; 3];
        for axis in 0..3 {
            min[axis] = tokens.next("domain bound")?;
            max[axis] = tokens.next("domain bound")?;
        }

        let has_velocity = match tokens.next::<u8>("velocity flag")? {
            0 => false,
            1 => true,
            other => {
                return Err(SotlError::Parse {
                    line: tokens.line,
                    message: format!("velocity flag must be 0 or 1, found {other}"),
                });
            }
        };

        let mut atoms = Vec::new();
        atoms.try_reserve_exact(natoms)?;
        for _ in 0..natoms {
            let pos = tokens.triple("position")?;
            let vel = if has_velocity {
                tokens.triple("velocity")?
            } else {
                random_velocity(rng)
            };
            atoms.push(AtomRecord { pos, vel });
        }

        debug!(natoms, has_velocity, ?min, ?max, "config parsed");
        Ok(Self { min, max, atoms })
    }

    /// Collect the own atoms of one or more sets under the bounds of `domain`
    pub fn from_atoms<'a>(domain: &Domain, sets: impl IntoIterator<Item = &'a AtomSet>) -> Self {
        let mut atoms = Vec::new();
        for set in sets {
            atoms.extend((set.begin()..set.end()).map(|i| AtomRecord {
                pos: set.position(i),
                vel: set.velocity(i),
            }));
        }
        Self {
            min: domain.requested_min(),
            max: domain.requested_max(),
            atoms,
        }
    }

    pub fn natoms(&self) -> usize {
        self.atoms.len()
    }

    /// Render with velocities, six decimals per float
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Append every atom to `set`, which must have room for them
    pub fn fill(&self, set: &mut AtomSet) -> SotlResult<()> {
        for atom in &self.atoms {
            set.add(atom.pos, atom.vel)?;
        }
        Ok(())
    }
}

impl fmt::Display for AtomConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:09}", self.atoms.len())?;
        for axis in 0..3 {
            writeln!(f, "{:.6} {:.6}", self.min[axis], self.max[axis])?;
        }
        writeln!(f, "1")?;
        for atom in &self.atoms {
            let [x, y, z] = atom.pos;
            let [vx, vy, vz] = atom.vel;
            writeln!(f, "{x:.6} {y:.6} {z:.6}")?;
            writeln!(f, "{vx:.6} {vy:.6} {vz:.6}")?;
        }
        Ok(())
    }
}

/// Read a config file from disk
pub fn load_config<R: Rng + ?Sized>(path: &Path, rng: &mut R) -> SotlResult<AtomConfig> {
    let text = fs::read_to_string(path)?;
    let config = AtomConfig::parse(&text, rng)?;
    info!(path = %path.display(), natoms = config.natoms(), "config loaded");
    Ok(config)
}

/// Write a config file to disk
pub fn save_config(path: &Path, config: &AtomConfig) -> SotlResult<()> {
    fs::write(path, config.to_text())?;
    info!(path = %path.display(), natoms = config.natoms(), "atoms dumped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ATOM_RADIUS;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const TWO_ATOMS: &str = "000000002
0.000000 2.000000
-1.000000 1.000000
0.500000 4.000000
1
0.250000 0.500000 1.000000
0.010000 -0.020000 0.000000
1.750000 0.000000 3.500000
0.000000 0.000000 0.030000
";

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn parses_atoms_with_velocities() {
        let config = AtomConfig::parse(TWO_ATOMS, &mut rng()).unwrap();
        assert_eq!(config.natoms(), 2);
        assert_eq!(config.min, [0.0, -1.0, 0.5]);
        assert_eq!(config.max, [2.0, 1.0, 4.0]);
        assert_eq!(config.atoms[1].pos, [1.75, 0.0, 3.5]);
        assert_eq!(config.atoms[0].vel, [0.01, -0.02, 0.0]);
    }

    #[test]
    fn writes_back_the_same_text() {
        let config = AtomConfig::parse(TWO_ATOMS, &mut rng()).unwrap();
        assert_eq!(config.to_text(), TWO_ATOMS);
    }

    #[test]
    fn dump_format_snapshot() {
        let config = AtomConfig {
            min: [0.0; 3],
            max: [1.2, 1.2, 2.0],
            atoms: vec![AtomRecord {
                pos: [0.4, 0.8, 1.0],
                vel: [0.001, 0.0, 0.002],
            }],
        };
        insta::assert_snapshot!(config.to_text(), @r"
        000000001
        0.000000 1.200000
        0.000000 1.200000
        0.000000 2.000000
        1
        0.400000 0.800000 1.000000
        0.001000 0.000000 0.002000
        ");
    }

    #[test]
    fn missing_velocities_are_synthesized() {
        let text = "3\n0 1\n0 1\n0 1\n0\n0.1 0.1 0.1\n0.5 0.5 0.5\n0.9 0.9 0.9\n";
        let a = AtomConfig::parse(text, &mut rng()).unwrap();
        let b = AtomConfig::parse(text, &mut rng()).unwrap();
        assert_eq!(a, b);
        for atom in &a.atoms {
            let [vx, vy, vz] = atom.vel;
            let speed = (vx * vx + vy * vy + vz * vz).sqrt();
            assert!(speed >= ATOM_RADIUS * 0.05 - 1e-6 && speed <= ATOM_RADIUS * 0.2 + 1e-6);
        }
    }

    #[test]
    fn errors_name_the_line() {
        let err = AtomConfig::parse("2\n0 1\n0 1\n0 1\n1\n0 0 x\n", &mut rng()).unwrap_err();
        assert!(matches!(err, SotlError::Parse { line: 6, .. }), "{err}");

        let err = AtomConfig::parse("1\n0 1\n0 1\n0 1\n1\n0 0 0\n", &mut rng()).unwrap_err();
        assert!(
            err.to_string().contains("unexpected end of file, expected velocity"),
            "{err}"
        );

        let err = AtomConfig::parse("1\n0 1\n0 1\n0 1\n2\n", &mut rng()).unwrap_err();
        assert!(matches!(err, SotlError::Parse { line: 5, .. }), "{err}");
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let text = "1\n0 1\n0 1\n0 1\n1\nnan 1 1\n0 0 0\n";
        let err = AtomConfig::parse(text, &mut rng()).unwrap_err();
        assert!(matches!(err, SotlError::Parse { line: 6, .. }), "{err}");
        assert!(err.to_string().contains("position must be finite"), "{err}");

        let text = "1\n0 1\n0 1\n0 1\n1\n0.5 0.5 0.5\n0 inf 0\n";
        let err = AtomConfig::parse(text, &mut rng()).unwrap_err();
        assert!(matches!(err, SotlError::Parse { line: 7, .. }), "{err}");
    }

    #[test]
    fn round_trips_through_an_atom_set() {
        let config = AtomConfig::parse(TWO_ATOMS, &mut rng()).unwrap();
        let mut set = AtomSet::new(config.natoms()).unwrap();
        config.fill(&mut set).unwrap();
        let domain = Domain::init(config.min, config.max, 0.6).unwrap();
        assert_eq!(AtomConfig::from_atoms(&domain, [&set]), config);
    }

    #[test]
    fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.conf");
        let config = AtomConfig::parse(TWO_ATOMS, &mut rng()).unwrap();
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path, &mut rng()).unwrap(), config);
        assert!(matches!(
            load_config(&dir.path().join("missing.conf"), &mut rng()),
            Err(SotlError::Io(_))
        ));
    }
}
