use std::path::PathBuf;
use std::thread;

use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use magnetar::buffer::sync_buffers;
use magnetar::checkpoint;
use magnetar::config::RuntimeConfig;
use magnetar::driver::{advance_level, conserved_totals};
use magnetar::exchange::{get_buffer_data, BufferMode, UseLb};
use magnetar::hierarchy::Hierarchy;
use magnetar::message::comm::Communicator;
use magnetar::message::local::local_group;
use magnetar::patch::{DENS, ENGY, PATCH_SIZE, _TOTAL};
use magnetar::solvers::advect::DonorCellAdvection;

/// Advect a smooth blob across a refined AMR hierarchy and watch the
/// conserved totals, dumping checkpoints along the way. Ranks run as
/// in-process threads over the channel transport.
///
#[derive(Clone, Debug, Parser)]
#[clap(version)]
struct Opts {
    #[clap(short = 'r', long, default_value = "1")]
    ranks_x: usize,

    #[clap(short = 'n', long, default_value = "2")]
    root_patches: usize,

    #[clap(short = 's', long, default_value = "10")]
    steps: usize,

    #[clap(long, default_value = "0.4")]
    cfl: f64,

    #[clap(long, default_value = "1.0")]
    vx: f64,

    #[clap(long, default_value = "0.5")]
    vy: f64,

    #[clap(long, default_value = "0.25")]
    vz: f64,

    #[clap(long, default_value = "0")]
    dump_every: usize,

    #[clap(long, default_value = "snapshot.amr")]
    dump_path: PathBuf,
}

fn main() {
    let opts = Opts::parse();
    init_logging();
    info!("{:?}", opts);

    let num_ranks = opts.ranks_x;
    let group = local_group(num_ranks);

    let workers: Vec<_> = group
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let opts = opts.clone();
            thread::spawn(move || run_rank(rank, comm, &opts))
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

fn run_rank<C: Communicator>(rank: usize, comm: C, opts: &Opts) {
    let n = opts.root_patches;
    let config = RuntimeConfig {
        box_size: (n * PATCH_SIZE) as f64,
        n_root: [n, n, n],
        max_level: 1,
        rank_dims: [opts.ranks_x, 1, 1],
        ..RuntimeConfig::default()
    };
    let velocity = [opts.vx, opts.vy, opts.vz];
    let v_max = velocity.iter().fold(1e-10_f64, |a, v| a.max(v.abs()));
    let dt = opts.cfl * config.cell_size(config.max_level) / v_max;

    let mut hier = Hierarchy::new(config, rank);
    hier.build_root();
    sync_buffers(&mut hier, &comm, 0);

    seed_blob(&mut hier);

    // refine the origin patch on whichever rank owns it
    if let Some(id) = hier.id_at_corner(0, [0, 0, 0]) {
        if hier.real_ids(0).contains(&id) {
            hier.refine(0, id).unwrap();
        }
    }
    sync_buffers(&mut hier, &comm, 0);
    sync_buffers(&mut hier, &comm, 1);
    for lv in 0..hier.num_levels() {
        let sg = hier.flu_sg[lv];
        get_buffer_data(
            &mut hier,
            &comm,
            lv,
            sg,
            0,
            BufferMode::DataAfterRefine,
            _TOTAL,
            2,
            UseLb::No,
        )
        .unwrap();
    }

    let solver = DonorCellAdvection { velocity };
    let mut dump_id = 0;

    for step in 0..opts.steps {
        advance_level(&mut hier, &comm, &solver, 0, dt).unwrap();

        let totals = conserved_totals(&hier);
        if rank == 0 {
            info!(
                "[{}] t={:.4} mass={:.12e} energy={:.12e}",
                step, hier.time[0], totals[DENS], totals[ENGY]
            );
        }

        if opts.dump_every > 0 && (step + 1) % opts.dump_every == 0 {
            let path = opts.dump_path.with_extension(format!("{:05}", dump_id));
            checkpoint::dump(&hier, &comm, dump_id, &path).unwrap();
            if rank == 0 {
                info!("dumped {}", path.display());
            }
            dump_id += 1;
        }
    }
}

/// A smooth positive density bump with a matching momentum field.
fn seed_blob(hier: &mut Hierarchy) {
    let finest = hier.config.cell_size_finest();
    let dh = hier.config.cell_size(0);
    let center = hier.config.box_size * 0.5;
    let width = hier.config.box_size * 0.15;

    let ids: Vec<_> = hier.real_ids(0).to_vec();
    for id in ids {
        let patch = hier.patch_mut(0, id);
        let edge = patch.edge_low(finest);
        let cube = patch.fluid[0].as_deref_mut().unwrap();

        for k in 0..PATCH_SIZE {
            for j in 0..PATCH_SIZE {
                for i in 0..PATCH_SIZE {
                    let x = edge[0] + (i as f64 + 0.5) * dh - center;
                    let y = edge[1] + (j as f64 + 0.5) * dh - center;
                    let z = edge[2] + (k as f64 + 0.5) * dh - center;
                    let r2 = (x * x + y * y + z * z) / (width * width);
                    let dens = 1.0 + 4.0 * (-r2).exp();

                    cube[DENS][k][j][i] = dens;
                    cube[ENGY][k][j][i] = 10.0 * dens;
                }
            }
        }
    }
}

fn init_logging() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();
}
