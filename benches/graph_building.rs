use criterion::{criterion_group, criterion_main, Criterion};

use tagmap::config::OptimizationConfig;
use tagmap::data::ObservationRecord;
use tagmap::mapping::{build_graph, optimize, BuildOptions, GaussNewtonSolver};

/// Walk along x with a tag every meter, 2 m in front of the camera.
fn record_json(n_frames: usize) -> String {
    let mut poses = Vec::new();
    let mut tags = Vec::new();
    for i in 0..n_frames {
        let x = 0.25 * i as f64;
        // column-major homogeneous matrix, timestamp, frame id
        let mut row = vec![
            1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, x, 0.0, 0.0, 1.0,
        ];
        row.extend([i as f64, i as f64]);
        poses.push(row);

        let tag_id = (x.round()) as i64;
        let dx = tag_id as f64 - x;
        // row-major camera-from-tag, tag straight ahead
        let mut tag = vec![tag_id as f64];
        tag.extend([
            1.0, 0.0, 0.0, dx, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 1.0,
        ]);
        tag.extend([i as f64, i as f64]);
        tags.push(vec![tag]);
    }
    serde_json::json!({ "pose_data": poses, "tag_data": tags }).to_string()
}

fn build_and_optimize(c: &mut Criterion) {
    let record = ObservationRecord::from_json(&record_json(200)).unwrap();
    c.bench_function("build_graph_200", |b| {
        b.iter(|| build_graph(&record, &BuildOptions::default()).unwrap())
    });
    let graph = build_graph(&record, &BuildOptions::default()).unwrap();
    c.bench_function("optimize_200", |b| {
        b.iter(|| {
            let mut g = graph.clone();
            optimize(&mut g, &OptimizationConfig::default(), &mut GaussNewtonSolver::default())
                .unwrap()
                .total_chi2
        })
    });
}

criterion_group!(benches, build_and_optimize);
criterion_main!(benches);
