use std::any::Any;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use location_core::{
    LocationConfig, LocationKey, LocationManager, StaticWorldHost, TickContext, TypeRegistry,
    WorldId, WorldObject,
};

#[derive(Debug, Default)]
struct Spinner {
    ticks: u64,
    location: Option<LocationKey>,
}

impl WorldObject for Spinner {
    fn block_type(&self) -> &str {
        "spinner"
    }

    fn tick_rate(&self) -> u32 {
        8
    }

    fn ticks_lived(&self) -> u64 {
        self.ticks
    }

    fn location(&self) -> Option<&LocationKey> {
        self.location.as_ref()
    }

    fn bind_location(&mut self, key: LocationKey) {
        self.location = Some(key);
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) {
        self.ticks += 1;
    }

    fn on_server_tick(&mut self, ctx: &mut TickContext<'_>) {
        ctx.mark_dirty();
    }

    fn freeze(&self) -> String {
        format!("ticks={}", self.ticks)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn bench_tick(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let world = WorldId::new("bench");
    let host = StaticWorldHost::new([world.clone()]).all_loaded();
    let mut group = c.benchmark_group("tick");

    for size in [64i32, 256, 1024] {
        group.bench_with_input(BenchmarkId::new("spinners", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let config = LocationConfig::default()
                        .with_database_path(dir.path().join(format!("tick_{size}.db")))
                        .with_save_interval(Duration::from_secs(3600));
                    let mut manager =
                        LocationManager::open(config, TypeRegistry::new()).expect("open store");
                    for i in 0..size {
                        let key = LocationKey::at(&world, i % 32, 64, i / 32);
                        manager
                            .register(key, Box::new(Spinner::default()), false)
                            .expect("vacant");
                    }
                    manager
                },
                |mut manager| {
                    for _ in 0..16 {
                        manager.tick(&host);
                    }
                    manager.shutdown();
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(tick_benches, bench_tick);
criterion_main!(tick_benches);
