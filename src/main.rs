use anyhow::Context;
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::EnvFilter;

use sotl::cli::Cli;
use sotl::config::RunConfig;
use sotl::context::SimulationContext;
use sotl::device::DeviceSelection;
use sotl::generator::{Tiles, fill_lattice, fill_random};
use sotl::io::load_config;

fn init_tracing(verbose: bool) {
    let default = if verbose { "sotl=debug" } else { "sotl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Context filled from `--natoms` generation or from the config file
fn build_context(
    cli: &Cli,
    config: RunConfig,
    rng: &mut StdRng,
) -> anyhow::Result<SimulationContext> {
    match cli.natoms.filter(|&n| n > 0) {
        Some(natoms) => {
            let tiles = Tiles::for_atoms(natoms);
            let tiles = if cli.random_atoms {
                tiles.randomized()
            } else {
                tiles
            };
            let (min, max) = tiles.bounds();
            let mut ctx = SimulationContext::init(natoms, min, max)?;
            ctx.configure(config)?;
            if cli.random_atoms {
                let domain = ctx.domain().clone();
                let min_gap = ctx.params().lj_sigma as f32;
                fill_random(ctx.atoms_mut()?, &domain, min_gap, rng)
                    .context("failed to place random atoms")?;
            } else {
                fill_lattice(ctx.atoms_mut()?, tiles)?;
            }
            Ok(ctx)
        }
        None => {
            let atoms = load_config(&cli.config, rng)
                .with_context(|| format!("failed to read {}", cli.config.display()))?;
            let mut ctx = SimulationContext::init(atoms.natoms(), atoms.min, atoms.max)?;
            ctx.configure(config)?;
            atoms.fill(ctx.atoms_mut()?)?;
            Ok(ctx)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list_devices {
        print!("{}", DeviceSelection::discover().listing());
        return Ok(());
    }

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let config = cli.run_config().context("invalid run configuration")?;
    let iterations = cli.iterations();
    let selection = cli
        .select(DeviceSelection::discover())
        .context("failed to select devices")?;

    let mut ctx = build_context(&cli, config, &mut rng)?;
    ctx.add_selection(&selection)?;
    ctx.distribute_across_backends()
        .context("failed to distribute atoms among selected devices")?;
    ctx.run_iterations(iterations)
        .context("simulation aborted")?;

    if cli.file_dump {
        ctx.dump_positions(&cli.dump_path)
            .with_context(|| format!("failed to write {}", cli.dump_path.display()))?;
    }
    if let Some(path) = &cli.report {
        ctx.report()
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    ctx.shutdown()?;
    Ok(())
}
