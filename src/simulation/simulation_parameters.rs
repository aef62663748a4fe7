use crate::{floating_type_mod::FT, sph_kernels::CohesionProfile, sph_kernels::SUPPORT_RADIUS_BY_SMOOTHING_LENGTH, vec2f, V2};
use serde::{Deserialize, Serialize};

/// Densities are never allowed to drop below this fraction of the rest density.
pub const DENSITY_FLOOR_BY_REST_DENSITY: FT = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionerType {
    /// 2x2 block per particle, scalar Jacobi for singular blocks
    BlockJacobi,
    Jacobi,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImplicitParams {
    pub enabled: bool,

    // which terms are linearized into the system matrix
    pub linearize_pressure: bool,
    pub linearize_viscosity: bool,
    pub linearize_cohesion: bool,

    /// Scales the velocity coupling that stands in for the cohesion springs.
    pub cohesion_stiffness: FT,

    /// Upper bound for (mean density / rest density) in the pressure Jacobian.
    pub max_pressure_density_ratio: FT,

    /// Relaxation rate towards the external drag velocity field (1/s).
    pub drag_coefficient: FT,

    pub max_iterations: usize,
    pub tolerance: FT,
    pub preconditioner: PreconditionerType,
}

impl Default for ImplicitParams {
    fn default() -> Self {
        ImplicitParams {
            enabled: false,
            linearize_pressure: true,
            linearize_viscosity: true,
            linearize_cohesion: true,
            cohesion_stiffness: 10.,
            max_pressure_density_ratio: 2.,
            drag_coefficient: 0.,
            max_iterations: 50,
            tolerance: 1e-4,
            preconditioner: PreconditionerType::BlockJacobi,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationParams {
    pub h: FT,
    pub rest_density: FT,
    pub particle_mass: FT,

    // Tait equation of state
    pub eos_stiffness: FT,
    pub eos_power: i32,

    pub viscosity: FT,

    // short range cohesion, range and falloff given in "number of h"
    pub cohesion_short_strength: FT,
    pub cohesion_short_range: FT,
    pub cohesion_short_falloff: FT,

    // long range cohesion, radius and falloff in world units
    pub cohesion_long_strength: FT,
    pub cohesion_long_radius: FT,
    pub cohesion_long_falloff: FT,

    // given in "number of h"
    pub cohesion_min_distance: FT,

    pub center_gravity: FT,

    pub container_radius: FT,
    pub boundary_restitution: FT,

    /// exponential velocity damping rate (1/s)
    pub damping: FT,
    pub max_speed: FT,

    pub max_particles: usize,
    /// hard cap for interactive use, spawning stops here even if `max_particles` is larger
    pub particle_ceiling: usize,
    // given in "number of h"
    pub spawn_radius: FT,
    pub seed: u64,

    /// spawn temperatures below this produce gel particles
    pub gel_temperature: FT,
    /// lower bound of the render alpha derived from density
    pub min_alpha: FT,

    pub implicit: ImplicitParams,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            h: 0.05,
            rest_density: 1000.,
            particle_mass: 2.,
            eos_stiffness: 50.,
            eos_power: 7,
            viscosity: 2.,
            cohesion_short_strength: 5.,
            cohesion_short_range: 1.5,
            cohesion_short_falloff: 0.5,
            cohesion_long_strength: 0.5,
            cohesion_long_radius: 0.3,
            cohesion_long_falloff: 0.1,
            cohesion_min_distance: 0.1,
            center_gravity: 0.5,
            container_radius: 1.,
            boundary_restitution: 0.5,
            damping: 1.,
            max_speed: 1.,
            max_particles: 10000,
            particle_ceiling: 2000,
            spawn_radius: 0.2,
            seed: 1,
            gel_temperature: 20.,
            min_alpha: 0.2,
            implicit: ImplicitParams::default(),
        }
    }
}

impl SimulationParams {
    pub fn support_radius(&self) -> FT {
        self.h * SUPPORT_RADIUS_BY_SMOOTHING_LENGTH
    }

    pub fn density_floor(&self) -> FT {
        self.rest_density * DENSITY_FLOOR_BY_REST_DENSITY
    }

    pub fn cohesion_short(&self) -> CohesionProfile {
        CohesionProfile {
            strength: self.cohesion_short_strength,
            range: self.cohesion_short_range * self.h,
            falloff: self.cohesion_short_falloff * self.h,
        }
    }

    pub fn cohesion_long(&self) -> CohesionProfile {
        CohesionProfile {
            strength: self.cohesion_long_strength,
            range: self.cohesion_long_radius,
            falloff: self.cohesion_long_falloff,
        }
    }

    pub fn cohesion_min_distance_world(&self) -> FT {
        self.cohesion_min_distance * self.h
    }

    pub fn spawn_radius_world(&self) -> FT {
        self.spawn_radius * self.h
    }

    /// Maximum number of particles the simulation will ever hold.
    pub fn particle_limit(&self) -> usize {
        self.particle_ceiling.min(self.max_particles)
    }

    /// Tait stiffness B, chosen so that `c^2 = B * gamma / rho0` at rest.
    pub fn speed_of_sound_sq(&self, density_ratio: FT) -> FT {
        if density_ratio < 1. {
            return 0.;
        }
        self.eos_stiffness * self.eos_power as FT / self.rest_density * density_ratio.powi(self.eos_power - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnEvent {
    /// simulation time in seconds at which the particles appear
    pub time: FT,
    pub center: [FT; 2],
    pub count: usize,
    pub color: [FT; 3],
    pub temperature: FT,
}

impl SpawnEvent {
    pub fn center(&self) -> V2 {
        vec2f(self.center[0], self.center[1])
    }
}

/// Drag velocity field of a rigid swirl around the container center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragSwirl {
    pub strength: FT,
}

impl DragSwirl {
    pub fn velocity_at(&self, position: V2) -> V2 {
        vec2f(-position.y, position.x) * self.strength
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub dt: FT,
    #[serde(default)]
    pub spin_rate: FT,
    pub spawns: Vec<SpawnEvent>,
    #[serde(default)]
    pub drag: Option<DragSwirl>,
}

#[test]
fn default_params_roundtrip_through_yaml() {
    let params = SimulationParams::default();
    let yaml = serde_yaml::to_string(&params).unwrap();
    let parsed: SimulationParams = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed.h, params.h);
    assert_eq!(parsed.eos_power, 7);
    assert_eq!(parsed.implicit.preconditioner, PreconditionerType::BlockJacobi);
}

#[test]
fn shipped_config_matches_defaults() {
    let yaml = include_str!("../../configs/simulation.yaml");
    let parsed: SimulationParams = serde_yaml::from_str(yaml).unwrap();
    let default = SimulationParams::default();
    assert_eq!(serde_yaml::to_value(parsed).unwrap(), serde_yaml::to_value(default).unwrap());
}

#[test]
fn shipped_scene_parses() {
    let yaml = include_str!("../../configs/scene.yaml");
    let scene: SceneConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(scene.dt > 0.);
    assert!(!scene.spawns.is_empty());
}

#[test]
fn derived_lengths_scale_with_h() {
    let params = SimulationParams::default();
    crate::assert_ft_approx_eq(params.support_radius(), 0.1, 1e-6, || format!("support radius"));
    crate::assert_ft_approx_eq(params.cohesion_short().range, 0.075, 1e-6, || format!("short range"));
    crate::assert_ft_approx_eq(params.spawn_radius_world(), 0.01, 1e-6, || format!("spawn radius"));
    assert_eq!(params.particle_limit(), 2000);
    assert_eq!(params.speed_of_sound_sq(0.5), 0.);
    crate::assert_ft_approx_eq(params.speed_of_sound_sq(1.), 0.35, 1e-6, || format!("c^2 at rest"));
}
