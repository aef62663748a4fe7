use std::{
    collections::HashMap,
    error::Error,
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::{
    floating_type_mod::FT,
    simulation_parameters::{SceneConfig, SimulationParams, SpawnEvent},
    statistics::write_statistics,
    FluidSimulation, V2, V3,
};

use super::vtk_exporter::VtkExporter;

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Simulated seconds when `--max-seconds` is not given.
const DEFAULT_MAX_SECONDS: FT = 10.;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse { path: String, source: serde_yaml::Error },
    NotAMapping { path: String },
    UnknownOverrideKey { key: String },
    InvalidArgument { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "failed reading `{}`: {}", path, source),
            ConfigError::Parse { path, source } => write!(f, "failed parsing `{}`: {}", path, source),
            ConfigError::NotAMapping { path } => write!(f, "`{}` is not a YAML mapping", path),
            ConfigError::UnknownOverrideKey { key } => write!(f, "override key `{}` is not a simulation parameter", key),
            ConfigError::InvalidArgument { name, value } => write!(f, "invalid value `{}` for {}", value, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.into(),
        source,
    })
}

fn parse_yaml<T: serde::de::DeserializeOwned>(yaml: &str, path: &str) -> Result<T, ConfigError> {
    serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
        path: path.into(),
        source,
    })
}

/// Replaces top-level keys of `params` with the values in `overwrite`. Every key must already exist.
fn apply_overrides(
    params: &mut serde_yaml::Value,
    overwrite: HashMap<String, serde_yaml::Value>,
    path: &str,
) -> Result<(), ConfigError> {
    let mapping = params
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::NotAMapping { path: path.into() })?;
    for (k, v) in overwrite.into_iter() {
        *mapping
            .get_mut(&serde_yaml::Value::String(k.clone()))
            .ok_or(ConfigError::UnknownOverrideKey { key: k })? = v;
    }
    Ok(())
}

fn simulation_params_from_yaml(
    params_yaml: &str,
    params_path: &str,
    overwrite: Option<(&str, &str)>,
) -> Result<SimulationParams, ConfigError> {
    let mut simulation_params_serde: serde_yaml::Value = parse_yaml(params_yaml, params_path)?;

    if let Some((overwrite_yaml, overwrite_path)) = overwrite {
        let overwrite_config: HashMap<String, serde_yaml::Value> = parse_yaml(overwrite_yaml, overwrite_path)?;
        apply_overrides(&mut simulation_params_serde, overwrite_config, params_path)?;
    }

    serde_yaml::from_value(simulation_params_serde).map_err(|source| ConfigError::Parse {
        path: params_path.into(),
        source,
    })
}

fn load_simulation_params(run_matches: &ArgMatches) -> Result<SimulationParams, ConfigError> {
    let parameter_file = run_matches.value_of("SIMULATION_CONFIG").unwrap_or_default();
    let params_yaml = read_file(parameter_file)?;

    let mut simulation_params = match run_matches.value_of("OVERWRITE_CONFIG_FILE") {
        Some(overwrite_file) => {
            let overwrite_yaml = read_file(overwrite_file)?;
            simulation_params_from_yaml(&params_yaml, parameter_file, Some((&overwrite_yaml, overwrite_file)))?
        }
        None => simulation_params_from_yaml(&params_yaml, parameter_file, None)?,
    };

    if run_matches.is_present("IMPLICIT") {
        simulation_params.implicit.enabled = true;
    }
    Ok(simulation_params)
}

fn load_scene(path: &str) -> Result<SceneConfig, ConfigError> {
    let mut scene_config: SceneConfig = parse_yaml(&read_file(path)?, path)?;
    if !(scene_config.dt > 0.) {
        return Err(ConfigError::InvalidArgument {
            name: "scene dt",
            value: scene_config.dt.to_string(),
        });
    }
    scene_config
        .spawns
        .sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scene_config)
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

pub fn start() -> Result<(), Box<dyn Error>> {
    let matches = App::new("Cohesive SPH Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation paramaters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("MAX_SECONDS")
                        .long("max-seconds")
                        .short("s")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given amount of simulated seconds"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                )
                .arg(
                    Arg::with_name("VTK_OUTPUT")
                        .long("vtk-output")
                        .required(false)
                        .takes_value(true)
                        .help("Folder for per-frame VTK snapshots"),
                )
                .arg(
                    Arg::with_name("IMPLICIT")
                        .long("implicit")
                        .takes_value(false)
                        .help("Use the implicit velocity solve regardless of the config"),
                ),
        )
        .subcommand(SubCommand::with_name("print-default-config").about("Print the default simulation parameters as YAML"))
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    if let Some(run_matches) = matches.subcommand_matches("run") {
        let simulation_params = load_simulation_params(run_matches)?;
        log::info!("{:?}", simulation_params);

        let scene_config = load_scene(run_matches.value_of("SCENE_CONFIG").unwrap_or_default())?;
        log::info!("{:?}", scene_config);

        let max_seconds = match run_matches.value_of("MAX_SECONDS") {
            Some(x) => x.parse::<FT>().map_err(|_| ConfigError::InvalidArgument {
                name: "--max-seconds",
                value: x.into(),
            })?,
            None => DEFAULT_MAX_SECONDS,
        };

        let run_options = RunOptions {
            max_seconds,
            counters_enabled: run_matches.is_present("STATISTICS_ENABLED"),
            vtk_output: run_matches.value_of("VTK_OUTPUT").map(PathBuf::from),
            print_frames: true,
        };

        let fluid_simulation = run_scene(simulation_params, &scene_config, &run_options)?;

        if run_options.counters_enabled {
            let s = write_statistics(&fluid_simulation)?;
            print!("{}", s);
            if let Some(statistics_path) = run_matches.value_of("STATISTICS_PATH") {
                std::fs::write(statistics_path, s)?;
            }
        }
    } else if matches.subcommand_matches("print-default-config").is_some() {
        print!("{}", serde_yaml::to_string(&SimulationParams::default())?);
    }

    Ok(())
}

struct RunOptions {
    max_seconds: FT,
    counters_enabled: bool,
    vtk_output: Option<PathBuf>,
    print_frames: bool,
}

fn spawn_event(fluid_simulation: &mut FluidSimulation, event: &SpawnEvent) {
    let created = fluid_simulation.spawn_particles(event.center(), event.count, V3::from(event.color), event.temperature);
    log::info!(
        "t={:.3}: spawned {} of {} particles ({} total)",
        fluid_simulation.time,
        created,
        event.count,
        fluid_simulation.num_particles()
    );
}

/// Plays the scene headlessly at the fixed scene time step until `max_seconds` of simulated time.
fn run_scene(
    simulation_params: SimulationParams,
    scene_config: &SceneConfig,
    options: &RunOptions,
) -> Result<FluidSimulation, Box<dyn Error>> {
    let mut fluid_simulation = FluidSimulation::new(simulation_params, options.counters_enabled);

    let mut vtk_exporter = match &options.vtk_output {
        Some(folder) => Some(VtkExporter::new(folder, "cohesive-sph")?),
        None => None,
    };

    let mut total_duration: Duration = Duration::from_nanos(0);
    let mut frame_number: u32 = 0;
    let mut next_spawn = 0;

    while fluid_simulation.time < options.max_seconds {
        while let Some(event) = scene_config.spawns.get(next_spawn) {
            if event.time > fluid_simulation.time {
                break;
            }
            spawn_event(&mut fluid_simulation, event);
            next_spawn += 1;
        }

        if let Some(swirl) = &scene_config.drag {
            let drag_field: Vec<V2> = fluid_simulation
                .particles
                .position
                .iter()
                .map(|x| swirl.velocity_at(*x))
                .collect();
            fluid_simulation.set_drag_field(Some(drag_field))?;
        }

        let a = Instant::now();
        let report = fluid_simulation.step(scene_config.dt, scene_config.spin_rate)?;
        let b = Instant::now();

        total_duration += b - a;
        frame_number += 1;

        if let Some(vtk_exporter) = &mut vtk_exporter {
            vtk_exporter.add_snapshot(&fluid_simulation)?;
        }

        if options.print_frames {
            let cg_str = match &report.implicit {
                Some(stats) => format!(" cg {} iterations", stats.iterations),
                None => String::new(),
            };
            println!(
                "{:05}: {} fluid particles {}msec ({}msec AVG){}",
                frame_number,
                fluid_simulation.num_particles(),
                (b - a).as_secs_f32() * 1000.,
                (total_duration / frame_number).as_secs_f32() * 1000.,
                cg_str
            );
        }
    }

    Ok(fluid_simulation)
}

#[test]
fn overrides_replace_known_keys_only() {
    let params_yaml = serde_yaml::to_string(&SimulationParams::default()).unwrap();

    let params = simulation_params_from_yaml(&params_yaml, "params.yaml", Some(("viscosity: 7.5\nseed: 3\n", "o.yaml")))
        .unwrap();
    assert_eq!(params.viscosity, 7.5);
    assert_eq!(params.seed, 3);
    assert_eq!(params.h, SimulationParams::default().h);

    let err = simulation_params_from_yaml(&params_yaml, "params.yaml", Some(("no_such_key: 1\n", "o.yaml"))).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownOverrideKey { ref key } if key == "no_such_key"));
}

#[test]
fn shipped_implicit_override_enables_solver() {
    let params = simulation_params_from_yaml(
        include_str!("../../../configs/simulation.yaml"),
        "simulation.yaml",
        Some((include_str!("../../../configs/implicit.yaml"), "implicit.yaml")),
    )
    .unwrap();
    assert!(params.implicit.enabled);
    assert!(params.implicit.drag_coefficient > 0.);
}

#[test]
fn malformed_config_is_a_parse_error() {
    let err = simulation_params_from_yaml("h: [1, 2", "broken.yaml", None).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("broken.yaml"));
}

#[test]
fn headless_scene_spawns_on_schedule() {
    use crate::simulation_parameters::DragSwirl;

    let mut params = SimulationParams::default();
    params.implicit.enabled = true;
    params.implicit.drag_coefficient = 1.;

    let scene = SceneConfig {
        dt: 1. / 60.,
        spin_rate: 0.3,
        spawns: vec![
            SpawnEvent {
                time: 0.,
                center: [0., 0.],
                count: 30,
                color: [1., 0.5, 0.],
                temperature: 30.,
            },
            SpawnEvent {
                time: 0.1,
                center: [0.3, 0.],
                count: 20,
                color: [0., 0.5, 1.],
                temperature: 10.,
            },
            SpawnEvent {
                time: 100.,
                center: [0., 0.],
                count: 20,
                color: [0., 0.5, 1.],
                temperature: 10.,
            },
        ],
        drag: Some(DragSwirl { strength: 0.2 }),
    };
    let options = RunOptions {
        max_seconds: 0.25,
        counters_enabled: true,
        vtk_output: None,
        print_frames: false,
    };

    let fluid_simulation = run_scene(params, &scene, &options).unwrap();
    assert_eq!(fluid_simulation.num_particles(), 50);
    assert!(fluid_simulation.step_number() >= 15);
    assert!(fluid_simulation.time >= 0.25);
    assert!(fluid_simulation
        .particles
        .position
        .iter()
        .all(|x| x.x.is_finite() && x.y.is_finite() && x.norm() <= params.container_radius * (1. + 1e-5)));
    assert!(fluid_simulation.value_counters().get("cg-iterations").is_some());

    let statistics = write_statistics(&fluid_simulation).unwrap();
    assert!(statistics.contains("simulation-step"));
    assert!(statistics.contains("particle-count"));
}
