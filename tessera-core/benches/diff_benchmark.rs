use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use serde_json::json;
use tessera_core::{diff, patch, WorldState};

/// Dense square of glyph cells, some with style records.
fn make_world(side: u32, glyph: &str) -> WorldState {
    let mut world = WorldState::new();
    for x in 0..side {
        for y in 0..side {
            let value = if (x + y) % 7 == 0 {
                json!({"char": glyph, "fg": "#ff0000", "bg": "#000000"})
            } else {
                json!(glyph)
            };
            world.set(format!("{x},{y}"), value);
        }
    }
    world
}

fn bench_diff_unchanged(c: &mut Criterion) {
    let world = make_world(100, "#");
    c.bench_function("diff_10k_cells_unchanged", |b| {
        b.iter(|| black_box(diff(black_box(world.as_map()), black_box(world.as_map()))))
    });
}

fn bench_diff_sparse_edit(c: &mut Criterion) {
    let base = make_world(100, "#");
    let mut current = base.clone();
    for i in 0..50 {
        current.set(format!("{i},{i}"), json!("@"));
    }
    c.bench_function("diff_10k_cells_50_edits", |b| {
        b.iter(|| black_box(diff(black_box(current.as_map()), black_box(base.as_map()))))
    });
}

fn bench_patch_replay(c: &mut Criterion) {
    let base = make_world(100, "#");
    let current = make_world(100, ".");
    let d = diff(current.as_map(), base.as_map());
    c.bench_function("patch_10k_cells_full_rewrite", |b| {
        b.iter(|| black_box(patch(black_box(base.as_map()), black_box(&d))))
    });
}

criterion_group!(benches, bench_diff_unchanged, bench_diff_sparse_edit, bench_patch_replay);
criterion_main!(benches);
