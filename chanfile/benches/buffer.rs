//! Microbenchmarks for the circular buffers and the channel write path.
//!
//! Run with: `cargo bench -p chanfile -- buffer`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use chanfile::stride::Fixed;
use chanfile::time::MAX_TIME;
use chanfile::{
    Channel, ChannelConfig, ChannelKind, CircBuffer, CircWaveBuffer, CodeFilter, Marker, MemStore,
    Tick, TimeRange,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn bench_circ_push_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer/push_free");

    for batch in [1usize, 16, 256] {
        let mut buf: CircBuffer<Fixed<Tick>> = CircBuffer::with_capacity(4096);
        let mut t: Tick = 0;
        let mut times = vec![0; batch];

        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, _| {
            b.iter(|| {
                for slot in &mut times {
                    t += 1;
                    *slot = t;
                }
                if buf.space() < batch {
                    buf.free(batch);
                }
                black_box(buf.push(black_box(&times)));
            });
        });
    }

    group.finish();
}

fn bench_circ_prev_n(c: &mut Criterion) {
    let mut buf: CircBuffer<Fixed<Marker>> = CircBuffer::with_capacity(65_536);
    // wrap the window so searches cross the split
    let early: Vec<Marker> = (0..32_768).map(Marker::new).collect();
    buf.push(&early);
    buf.free(16_384);
    let late: Vec<Marker> = (32_768..81_920)
        .map(|t| Marker::with_codes(t, [(t % 8) as u8, 0, 0, 0]))
        .collect();
    buf.push(&late);

    let filter = CodeFilter::only_codes(&[3]);

    c.bench_function("buffer/prev_n_time/unfiltered", |b| {
        b.iter(|| {
            let mut cursor = TimeRange::new(0, 81_920, 10_000, false, 0);
            black_box(buf.prev_n_time(&mut cursor, None))
        });
    });

    c.bench_function("buffer/prev_n_time/filtered", |b| {
        b.iter(|| {
            let mut cursor = TimeRange::new(0, 81_920, 1_000, false, 0);
            black_box(buf.prev_n_time(&mut cursor, Some(&filter)))
        });
    });
}

fn bench_wave_add_free(c: &mut Criterion) {
    let mut buf: CircWaveBuffer<i16> = CircWaveBuffer::new(65_536, 10);
    let chunk: Vec<i16> = (0..1000).map(|i| i as i16).collect();
    let mut t: Tick = 0;

    c.bench_function("buffer/wave_add_free", |b| {
        b.iter(|| {
            if buf.space() < chunk.len() {
                buf.free(chunk.len());
            }
            black_box(buf.add(black_box(&chunk), t));
            t += chunk.len() as Tick * 10;
        });
    });
}

fn bench_channel_events(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer/channel_events");

    for buffer in [1024usize, 65_536] {
        let mut store = MemStore::new(4096);
        let config = ChannelConfig::events(ChannelKind::EventRise, buffer);
        let mut chan = Channel::new(1, config, 4096).unwrap();
        let mut t: Tick = 0;
        let mut batch = [0 as Tick; 64];

        group.bench_with_input(BenchmarkId::from_parameter(buffer), &buffer, |b, _| {
            b.iter(|| {
                for slot in &mut batch {
                    t += 1;
                    *slot = t;
                }
                chan.write_events(&mut store, black_box(&batch)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_channel_read(c: &mut Criterion) {
    let mut store = MemStore::new(4096);
    let config = ChannelConfig::events(ChannelKind::EventRise, 8192);
    let mut chan = Channel::new(1, config, 4096).unwrap();
    let times: Vec<Tick> = (1..=200_000).collect();
    chan.write_events(&mut store, &times).unwrap();

    let mut out = Vec::with_capacity(200_000);
    c.bench_function("buffer/channel_read_all", |b| {
        b.iter(|| {
            out.clear();
            let mut cursor = TimeRange::new(0, MAX_TIME, 200_000, true, 0);
            black_box(chan.read_events(&store, &mut cursor, &mut out).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_circ_push_free,
    bench_circ_prev_n,
    bench_wave_add_free,
    bench_channel_events,
    bench_channel_read
);
criterion_main!(benches);
