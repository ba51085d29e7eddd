use clap::Parser;
use ct_icp::{
    config::{self, OdometryOptions},
    io,
    odometry::{FrameStatus, Odometry},
    point3d,
};
use glob::glob;
use nalgebra as na;
use std::{fs, io::Write};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct CtIcpCli {
    /// glob of pcd files, one sweep per file, e.g. "./pcd/*.pcd"
    #[arg(default_value = "./pcd/*.pcd")]
    path: String,

    /// odometry options as json
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 0)]
    start: usize,

    #[arg(long)]
    max_frames: Option<usize>,

    #[arg(long, default_value_t = 0.5)]
    min_range: f64,

    #[arg(long, default_value_t = 100.0)]
    max_range: f64,

    /// overrides the distance metric, e.g. POINT_TO_PLANE
    #[arg(long)]
    distance: Option<String>,

    /// overrides the solver, e.g. GN, CERES, ROBUST
    #[arg(long)]
    solver: Option<String>,

    /// trajectory file, one kitti pose row per frame
    #[arg(long)]
    output: Option<String>,

    /// writes the default options to this path and exits
    #[arg(long)]
    write_default_config: Option<String>,
}

fn kitti_row(pose: &na::Isometry3<f64>) -> String {
    let m = pose.to_homogeneous();
    (0..3)
        .flat_map(|r| (0..4).map(move |c| (r, c)))
        .map(|(r, c)| format!("{:.9}", m[(r, c)]))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = CtIcpCli::parse();

    if let Some(path) = cli.write_default_config {
        io::write_options_json(&path, &OdometryOptions::default())?;
        log::info!("default options written to {}", path);
        return Ok(());
    }

    let mut options = match &cli.config {
        Some(path) => io::json_to_options(path)?,
        None => OdometryOptions::default(),
    };
    if let Some(distance) = &cli.distance {
        options.registration.distance = config::parse_tag("distance", distance)?;
    }
    if let Some(solver) = &cli.solver {
        options.registration.solver = config::parse_tag("solver", solver)?;
    }
    let mut odometry = Odometry::new(options)?;

    let mut rows = Vec::new();
    let mut num_degraded = 0;
    let paths = glob(&cli.path)?
        .filter_map(Result::ok)
        .skip(cli.start)
        .take(cli.max_frames.unwrap_or(usize::MAX));
    for path in paths {
        let frame = io::read_pcd_frame(&path)?;
        let frame = point3d::clip_point_cloud_by_distance(&frame, cli.min_range, cli.max_range);
        let result = odometry.register_frame(&frame);
        if result.status == FrameStatus::Degraded {
            num_degraded += 1;
        }
        log::info!(
            "{} -> {:?}, t = {:?}",
            path.display(),
            result.status,
            result.poses.end.translation.vector.as_slice()
        );
        rows.push(kitti_row(&result.poses.end));
    }
    log::info!(
        "{} frames registered, {} degraded, map of {} points in {} voxels",
        rows.len(),
        num_degraded,
        odometry.map().map_len(),
        odometry.map().num_voxels()
    );

    match &cli.output {
        Some(path) => {
            let mut file = fs::File::create(path)?;
            for row in &rows {
                writeln!(file, "{}", row)?;
            }
        }
        None => rows.iter().for_each(|row| println!("{}", row)),
    }
    Ok(())
}
