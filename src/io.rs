use crate::{
    config::OdometryOptions,
    error::IoError,
    point3d::{frame_from_points, Point3d, TimedPoint},
};
use std::{
    fs,
    io::{BufReader, Write},
    path::Path,
};

/// Loads and validates odometry options. Missing fields take their defaults.
pub fn json_to_options<P: AsRef<Path>>(path: P) -> Result<OdometryOptions, IoError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let options: OdometryOptions = serde_json::from_reader(reader)?;
    options.validate()?;
    Ok(options)
}

pub fn write_options_json<P: AsRef<Path>>(path: P, options: &OdometryOptions) -> Result<(), IoError> {
    let j = serde_json::to_string_pretty(options)?;
    let mut file = fs::File::create(path)?;
    file.write_all(j.as_bytes())?;
    Ok(())
}

pub fn read_pcd_points<P: AsRef<Path>>(path: P) -> Result<Vec<Point3d>, IoError> {
    let reader = pcd_rs::Reader::open(path).map_err(|e| IoError::Pcd(e.to_string()))?;
    reader
        .collect::<Result<Vec<Point3d>, _>>()
        .map_err(|e| IoError::Pcd(e.to_string()))
}

/// Reads a sweep. Pcd points carry no time, so the storage order is taken as
/// the acquisition order over the sweep.
pub fn read_pcd_frame<P: AsRef<Path>>(path: P) -> Result<Vec<TimedPoint>, IoError> {
    let points = read_pcd_points(path)?;
    let timed: Vec<_> = points
        .iter()
        .enumerate()
        .map(|(i, pt)| (pt.to_na_vec_f64(), i as f64))
        .collect();
    Ok(frame_from_points(&timed))
}
