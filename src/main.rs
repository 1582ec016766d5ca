use neurocore::connectome::{edge_count, ExecutionTier};
use neurocore::crosscoder::{CrossCoder, HIDDEN, LATENT_DIM};
use neurocore::parcellation::Parcellation;
use neurocore::pipeline::{PipelineConfig, SimulationPipeline};
use neurocore::prng::Prng;

struct DemoArgs {
    regions: usize,
    seed: u64,
    t_max: f64,
    dt: f64,
    tier: ExecutionTier,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            regions: 86,
            seed: 7,
            t_max: 100.0,
            dt: 0.1,
            tier: ExecutionTier::Scalar,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }
    if args.len() >= 2 && args[1] == "write-model" {
        run_write_model(&args[2..]);
        return;
    }

    let demo = match parse_demo_args(&args[1..]) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            print_help();
            std::process::exit(2);
        }
    };
    run_demo(&demo);
}

fn print_help() {
    println!("neurocore demo");
    println!();
    println!("Usage:");
    println!("  neurocore [--regions N] [--seed S] [--t-max T] [--dt DT] [--tier scalar|simd|parallel]");
    println!("      Simulate a seeded random network and print its summary.");
    println!("  neurocore write-model <path> [--hidden 1024,512,128] [--latent 16] [--seed S]");
    println!("      Write a randomly initialized reconstruction checkpoint (86 -> 463).");
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} needs a value"))
}

fn parse_num<T: std::str::FromStr>(s: &str, flag: &str) -> Result<T, String> {
    s.parse().map_err(|_| format!("{flag}: invalid value {s:?}"))
}

fn parse_demo_args(args: &[String]) -> Result<DemoArgs, String> {
    let mut out = DemoArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = flag_value(args, i, flag)?;
        match flag {
            "--regions" => out.regions = parse_num(value, flag)?,
            "--seed" => out.seed = parse_num(value, flag)?,
            "--t-max" => out.t_max = parse_num(value, flag)?,
            "--dt" => out.dt = parse_num(value, flag)?,
            "--tier" => {
                out.tier = match value {
                    "scalar" => ExecutionTier::Scalar,
                    "simd" => ExecutionTier::Simd,
                    "parallel" => ExecutionTier::Parallel,
                    other => return Err(format!("unknown tier: {other}")),
                }
            }
            other => return Err(format!("unknown option: {other}")),
        }
        i += 2;
    }
    Ok(out)
}

fn run_demo(demo: &DemoArgs) {
    let config = PipelineConfig::default().with_horizon(demo.t_max, demo.dt);
    let config = config.with_params(config.params.with_tier(demo.tier));
    let pipeline = SimulationPipeline::new(config, None, None);

    // Sparse-ish positive connectome: most edges weak, a few strong.
    let mut rng = Prng::new(demo.seed);
    let coupling: Vec<f64> = (0..edge_count(demo.regions))
        .map(|_| {
            let w = rng.next_f64_01();
            if w > 0.9 {
                w
            } else {
                0.05 * w
            }
        })
        .collect();

    println!(
        "regions={} edges={} t_max={} dt={} tier={:?} (effective {:?})",
        demo.regions,
        coupling.len(),
        demo.t_max,
        demo.dt,
        demo.tier,
        demo.tier.effective()
    );

    let started = std::time::Instant::now();
    match pipeline.simulate_coupling(&coupling, demo.regions, &mut rng) {
        Ok(out) => {
            let s = &out.summary;
            let stats = out.trajectory.stats;
            println!(
                "state={} mean_r={:.4} mean_V={:.4} samples={}",
                s.regime,
                s.mean_r,
                s.mean_v,
                out.trajectory.timesteps()
            );
            println!(
                "solver: accepted={} rejected={} rhs_evals={} elapsed={:.1}ms",
                stats.accepted_steps,
                stats.rejected_steps,
                stats.rhs_evals,
                started.elapsed().as_secs_f64() * 1000.0
            );
            let stride = (s.r_series.len() / 10).max(1);
            println!("    t      r̄        V̄");
            for k in (0..s.r_series.len()).step_by(stride) {
                println!(
                    "{:>6.1} {:>8.4} {:>8.4}",
                    out.trajectory.t[k], s.r_series[k], s.v_series[k]
                );
            }
        }
        Err(e) => {
            eprintln!("simulation failed ({}): {e}", e.kind());
            std::process::exit(1);
        }
    }
}

fn run_write_model(args: &[String]) {
    let Some(path) = args.first() else {
        print_help();
        std::process::exit(2);
    };
    let mut hidden: Vec<usize> = HIDDEN.to_vec();
    let mut latent = LATENT_DIM;
    let mut seed = 1u64;

    let parsed: Result<(), String> = (|| {
        let rest = &args[1..];
        let mut i = 0;
        while i < rest.len() {
            let flag = rest[i].as_str();
            let value = flag_value(rest, i, flag)?;
            match flag {
                "--hidden" => {
                    hidden = value
                        .split(',')
                        .map(|w| parse_num(w.trim(), flag))
                        .collect::<Result<_, _>>()?
                }
                "--latent" => latent = parse_num(value, flag)?,
                "--seed" => seed = parse_num(value, flag)?,
                other => return Err(format!("unknown option: {other}")),
            }
            i += 2;
        }
        Ok(())
    })();
    if let Err(e) = parsed {
        eprintln!("{e}");
        std::process::exit(2);
    }

    let mut rng = Prng::new(seed);
    let coder = CrossCoder::with_random_weights(
        latent,
        &hidden,
        &[Parcellation::P86, Parcellation::P463],
        Parcellation::P463,
        &mut rng,
    );
    match coder.save_to_path(std::path::Path::new(path)) {
        Ok(()) => println!(
            "wrote {} ({} params, hidden={:?}, latent={})",
            path,
            coder.param_count(),
            hidden,
            latent
        ),
        Err(e) => {
            eprintln!("write {path}: {e}");
            std::process::exit(1);
        }
    }
}
