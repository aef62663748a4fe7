use std::{
    fmt,
    fs::{create_dir_all, File},
    io::{self, Write},
    path::PathBuf,
};

use vtkio::model::*;

use crate::{
    floating_type_mod::{FT, TAU},
    vec2f, FluidSimulation, V2, V4,
};

/// Number of line segments approximating the container circle.
const CONTAINER_SEGMENTS: usize = 64;

#[derive(Debug)]
pub enum VtkExportError {
    Io(io::Error),
    Vtk { path: PathBuf, message: String },
}

impl fmt::Display for VtkExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VtkExportError::Io(err) => write!(f, "vtk export: {}", err),
            VtkExportError::Vtk { path, message } => write!(f, "writing `{}` failed: {}", path.display(), message),
        }
    }
}

impl std::error::Error for VtkExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VtkExportError::Io(err) => Some(err),
            VtkExportError::Vtk { .. } => None,
        }
    }
}

impl From<io::Error> for VtkExportError {
    fn from(err: io::Error) -> Self {
        VtkExportError::Io(err)
    }
}

fn to_vec3d(v: &V2) -> [FT; 3] {
    [v.x, v.y, 0.]
}

pub(crate) struct VtkExporter {
    /// something like './data/cohesive-sph' which will get expanded to './data/cohesive-sph-00001.vtk' and './data/cohesive-sph.vtk.series'
    folder: PathBuf,
    basename: String,
    snapshot_number: usize,
    series_file: File,
}

impl VtkExporter {
    pub(crate) fn new(folder: impl Into<PathBuf>, basename: impl Into<String>) -> Result<VtkExporter, VtkExportError> {
        let folder: PathBuf = folder.into();
        let basename: String = basename.into();

        create_dir_all(&folder)?;

        let mut series_file = File::create(folder.join(format!("{}.vtk.series", basename)))?;
        let series_prelude_str = "{\n\"file-series-version\": \"1.0\",\n\"files\": [";
        series_file.write_all(series_prelude_str.as_bytes())?;

        log::info!("writing vtk snapshots to `{}`", folder.display());

        Ok(VtkExporter {
            series_file,
            folder,
            basename,
            snapshot_number: 1,
        })
    }

    pub(crate) fn add_snapshot(&mut self, fluid_simulation: &FluidSimulation) -> Result<(), VtkExportError> {
        if self.snapshot_number > 1 {
            self.series_file.write_all(",".as_bytes())?;
        }

        let vtk_filename = format!("{}-{:05}.vtk", self.basename, self.snapshot_number);
        Self::write_vtk_file(self.folder.join(&vtk_filename), fluid_simulation)?;

        write!(
            self.series_file,
            "\n{{ \"name\": \"{}\", \"time\": {} }}",
            vtk_filename, fluid_simulation.time
        )?;

        self.snapshot_number += 1;
        Ok(())
    }

    fn write_vtk_file(path: PathBuf, fluid_simulation: &FluidSimulation) -> Result<(), VtkExportError> {
        let particles = &fluid_simulation.particles;

        let data_ft: Vec<(String, Vec<FT>)> = vec![
            ("density".into(), particles.density.clone()),
            ("pressure".into(), particles.pressure.clone()),
            ("temperature".into(), particles.temperature.clone()),
        ];
        let data_vec: Vec<(String, Vec<V2>)> = vec![("velocity".into(), particles.velocity.clone())];
        let data_u8: Vec<(String, Vec<u8>)> = vec![("phase".into(), particles.phase.iter().map(|p| p.as_u8()).collect())];
        let colors: Vec<V4> = fluid_simulation.render_particles().map(|p| p.color).collect();

        let lines = container_lines(fluid_simulation.params().container_radius);

        write_poly_data(path, particles.position.clone(), data_ft, data_vec, data_u8, colors, lines)
    }
}

impl Drop for VtkExporter {
    fn drop(&mut self) {
        let series_end_str = "\n]\n}";
        if let Err(err) = self.series_file.write_all(series_end_str.as_bytes()) {
            log::warn!("could not finish vtk series file: {}", err);
        }
    }
}

fn container_lines(radius: FT) -> Vec<(V2, V2)> {
    let point = |k: usize| {
        let phi = TAU * k as FT / CONTAINER_SEGMENTS as FT;
        vec2f(radius * phi.cos(), radius * phi.sin())
    };
    (0..CONTAINER_SEGMENTS).map(|k| (point(k), point(k + 1))).collect()
}

/// Particles become vertex cells, `lines` become two-point line cells. Point attributes are
/// padded with zeros for the line points.
pub fn write_poly_data(
    path: PathBuf,
    mut positions: Vec<V2>,
    data_ft: Vec<(String, Vec<FT>)>,
    data_vec: Vec<(String, Vec<V2>)>,
    data_u8: Vec<(String, Vec<u8>)>,
    mut colors: Vec<V4>,
    lines: Vec<(V2, V2)>,
) -> Result<(), VtkExportError> {
    let mut data_arrays: Vec<DataArray> = Vec::new();
    let num_lines = lines.len();

    for (name, mut arr) in data_ft {
        let mut data_array = DataArray::scalars(name, 1);
        arr.resize(arr.len() + 2 * num_lines, 0.);
        data_array.data = arr.into();
        data_arrays.push(data_array);
    }

    for (name, mut arr) in data_vec {
        let mut data_array = DataArray::scalars(name, 3);
        arr.resize(arr.len() + 2 * num_lines, V2::zeros());
        data_array.data = arr.iter().flat_map(to_vec3d).collect::<Vec<_>>().into();
        data_arrays.push(data_array);
    }

    for (name, mut arr) in data_u8 {
        let mut data_array = DataArray::scalars(name, 1);
        arr.resize(arr.len() + 2 * num_lines, 0);
        data_array.data = arr.into();
        data_arrays.push(data_array);
    }

    // premultiplied rgba
    let mut color_array = DataArray::scalars("color", 4);
    colors.resize(colors.len() + 2 * num_lines, V4::zeros());
    color_array.data = colors.iter().flat_map(|c| [c.x, c.y, c.z, c.w]).collect::<Vec<_>>().into();
    data_arrays.push(color_array);

    let num_particles = positions.len();
    let vtk_verts: Vec<u32> = (0..num_particles).flat_map(|i| [1, i as u32]).collect();

    let mut vtk_line_indices: Vec<u32> = Vec::with_capacity(3 * num_lines);
    for (a, b) in lines {
        let a_idx = positions.len();
        positions.push(a);

        let b_idx = positions.len();
        positions.push(b);

        vtk_line_indices.extend([2, a_idx as u32, b_idx as u32]);
    }

    let vtk_points: Vec<FT> = positions.iter().flat_map(to_vec3d).collect();

    let vtk = Vtk {
        version: Version::new((4, 2)),
        byte_order: ByteOrder::BigEndian,
        title: String::from("Cohesive SPH Particles 1.0"),
        file_path: Some(path.clone()),
        data: DataSet::PolyData {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(PolyDataPiece {
                points: vtk_points.into(),
                verts: VertexNumbers::Legacy {
                    num_cells: num_particles as u32,
                    vertices: vtk_verts,
                }
                .into(),
                lines: VertexNumbers::Legacy {
                    num_cells: num_lines as u32,
                    vertices: vtk_line_indices,
                }
                .into(),
                data: Attributes {
                    cell: Vec::new(),
                    point: data_arrays.into_iter().map(Attribute::DataArray).collect(),
                },
                ..Default::default()
            }))],
        },
    };

    vtk.export(&path).map_err(|err| VtkExportError::Vtk {
        path,
        message: format!("{:?}", err),
    })
}

#[test]
fn container_outline_is_closed() {
    let lines = container_lines(2.);
    assert_eq!(lines.len(), CONTAINER_SEGMENTS);
    for (k, (a, b)) in lines.iter().enumerate() {
        crate::assert_ft_approx_eq(a.norm(), 2., 1e-5, || format!("segment {} start", k));
        let next = lines[(k + 1) % lines.len()].0;
        assert!((b - next).norm() < 1e-5);
    }
}

#[test]
fn exporter_writes_snapshots_and_series() {
    use crate::{simulation_parameters::SimulationParams, vec3f};

    let folder = std::env::temp_dir().join(format!("cohesive-sph-vtk-test-{}", std::process::id()));
    let mut fluid_simulation = FluidSimulation::new(SimulationParams::default(), false);
    fluid_simulation.spawn_particles(V2::zeros(), 12, vec3f(0.2, 0.4, 0.9), 30.);

    {
        let mut exporter = VtkExporter::new(&folder, "test").unwrap();
        exporter.add_snapshot(&fluid_simulation).unwrap();
        fluid_simulation.update(0.01, 0.);
        exporter.add_snapshot(&fluid_simulation).unwrap();
    }

    for name in ["test-00001.vtk", "test-00002.vtk"] {
        let content = std::fs::read(folder.join(name)).unwrap();
        assert!(content.starts_with(b"# vtk DataFile"), "{} has no vtk header", name);
    }

    let series = std::fs::read_to_string(folder.join("test.vtk.series")).unwrap();
    assert!(series.contains("\"name\": \"test-00001.vtk\", \"time\": 0"));
    assert!(series.contains("test-00002.vtk"));
    assert!(series.trim_end().ends_with("]\n}"));

    std::fs::remove_dir_all(&folder).unwrap();
}
