use std::path::PathBuf;

use clap::Parser;
use log::info;
use nalgebra::{DMatrix, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use factor_graph_rs::camera::ProjectionModel;
use factor_graph_rs::types::{Vec2, Vec3};
use factor_graph_rs::{CameraModelKind, Config, FactorGraph, Solver, VariableId};

/// Synthetic bundle adjustment: a camera sweeping an arc in front of a
/// landmark wall, solved from perturbed initial values.
#[derive(Parser, Debug)]
struct Args {
    /// Number of camera poses along the arc
    #[arg(long, default_value = "5")]
    poses: usize,

    /// Landmarks per side of the square wall grid
    #[arg(long, default_value = "6")]
    landmarks: usize,

    /// Initial perturbation magnitude [m, rad]
    #[arg(long, default_value = "0.05")]
    noise: f64,

    /// Pixel noise added to every observation [px]
    #[arg(long, default_value = "0.0")]
    pixel_noise: f64,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// JSON config overriding solver / graph defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// After solving, marginalize the first pose and solve again
    #[arg(long, default_value_t = false)]
    marginalize: bool,
}

/// Camera optical axis along world +x, rotated by `yaw` about world z
fn camera_pose(position: Vec3, yaw: f64) -> Isometry3<f64> {
    #[rustfmt::skip]
    let c_wc = Matrix3::new(
        0.0,  0.0, 1.0,
        -1.0, 0.0, 0.0,
        0.0, -1.0, 0.0,
    );
    let base = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(c_wc));
    let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw) * base;
    Isometry3::from_parts(Translation3::from(position), q)
}

fn random_vec(rng: &mut StdRng, scale: f64) -> Vec3 {
    if scale <= 0.0 {
        return Vec3::zeros();
    }
    Vec3::new(
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
    )
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(args.poses >= 2, "need at least two poses to fix scale");
    anyhow::ensure!(args.landmarks >= 2, "need at least a 2x2 landmark grid");

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut graph = FactorGraph::with_config(config.graph.clone());
    let proj = [450.0, 450.0, 320.0, 240.0];
    let dist = [-0.05, 0.01, 0.0005, -0.0003];
    let camera = graph.add_camera(0, [640, 480], CameraModelKind::PinholeRadtan4, &proj, &dist)?;
    graph.set_fixed(camera, true)?;
    let model = CameraModelKind::PinholeRadtan4.instantiate([640, 480], &[proj, dist].concat());

    // Ground truth
    let truth_poses: Vec<Isometry3<f64>> = (0..args.poses)
        .map(|k| {
            let s = k as f64 / (args.poses - 1) as f64 - 0.5;
            camera_pose(Vec3::new(-0.3 * s.abs(), 1.2 * s, 0.1 * s), -0.25 * s)
        })
        .collect();
    let truth_landmarks: Vec<Vec3> = (0..args.landmarks * args.landmarks)
        .map(|k| {
            let (row, col) = (k / args.landmarks, k % args.landmarks);
            let u = row as f64 / (args.landmarks - 1) as f64 - 0.5;
            let v = col as f64 / (args.landmarks - 1) as f64 - 0.5;
            Vec3::new(4.0 + 0.3 * (u * v), 2.0 * v, 1.5 * u)
        })
        .collect();

    // Perturbed initial values
    let poses: Vec<VariableId> = truth_poses
        .iter()
        .enumerate()
        .map(|(k, t_wc)| {
            let start = if k == 0 {
                *t_wc
            } else {
                let dt = random_vec(&mut rng, args.noise);
                let dr = random_vec(&mut rng, args.noise);
                Isometry3::new(dt, dr) * t_wc
            };
            graph.add_pose(k as f64, &start)
        })
        .collect();
    let landmarks: Vec<VariableId> = truth_landmarks
        .iter()
        .map(|p_w| graph.add_landmark(&(p_w + random_vec(&mut rng, 2.0 * args.noise))))
        .collect();

    // Gauge: strong prior on the first pose, weak one on the second for scale
    graph.add_pose_factor(poses[0], &truth_poses[0], DMatrix::identity(6, 6) * 1e6)?;
    graph.add_pose_factor(poses[1], &truth_poses[1], DMatrix::identity(6, 6))?;

    let mut observations = 0;
    for (pose, t_wc) in poses.iter().zip(&truth_poses) {
        for (landmark, p_w) in landmarks.iter().zip(&truth_landmarks) {
            let p_c = t_wc.inverse_transform_point(&(*p_w).into()).coords;
            let Ok((pixel, _)) = model.project(&p_c) else {
                continue;
            };
            let z: Vec2 = pixel + random_vec(&mut rng, args.pixel_noise).xy();
            graph.add_ba_factor(*pose, *landmark, camera, z, DMatrix::identity(2, 2))?;
            observations += 1;
        }
    }
    info!(
        "Scene: {} poses, {} landmarks, {} observations",
        poses.len(),
        landmarks.len(),
        observations
    );

    let rmse_before = graph.reprojection_rmse()?;
    let solver = Solver::new(config.solver.clone());
    let summary = solver.solve(&mut graph)?;
    let rmse_after = graph.reprojection_rmse()?;

    let landmark_error = landmarks
        .iter()
        .zip(&truth_landmarks)
        .map(|(id, p_w)| graph.landmark(*id).map(|p| (p - p_w).norm()))
        .collect::<factor_graph_rs::Result<Vec<f64>>>()?;
    let mean_landmark_error = landmark_error.iter().sum::<f64>() / landmark_error.len() as f64;

    let mut report = json!({
        "poses": poses.len(),
        "landmarks": landmarks.len(),
        "observations": observations,
        "rmse_before": rmse_before,
        "rmse_after": rmse_after,
        "mean_landmark_error": mean_landmark_error,
        "summary": summary,
    });

    if args.marginalize {
        let marg = graph.marginalize(&poses[..1])?;
        if let Some(factor) = marg {
            info!("Marginalized {} into {}", poses[0], factor);
        }
        let summary = solver.solve(&mut graph)?;
        report["marginalized"] = json!({
            "factor": marg.map(|factor| factor.0),
            "remaining_factors": graph.num_factors(),
            "rmse": graph.reprojection_rmse()?,
            "summary": summary,
        });
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
