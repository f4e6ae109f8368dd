//! Integration tests for channels filing into block stores.
//!
//! These exercise the full flow from writes through the circular buffer and
//! write block into a store, and back out through reads and backward
//! searches, including reopening a memory-mapped block file.

use chanfile::error::StoreError;
use chanfile::time::MAX_TIME;
use chanfile::{
    BlockHeader, BlockKind, BlockStore, ChanError, Channel, ChannelConfig, ChannelKind, CodeFilter,
    FileStore, Marker, MemStore, SearchOutcome, Tick, TimeRange,
};
use tempfile::tempdir;

const BLOCK: usize = 256;

fn all_events(chan: &Channel, store: &dyn BlockStore) -> Vec<Tick> {
    let mut out = Vec::new();
    chan.read_events(store, &mut TimeRange::new(0, MAX_TIME, usize::MAX, true, 0), &mut out)
        .unwrap();
    out
}

fn all_markers(chan: &Channel, store: &dyn BlockStore, filter: Option<&CodeFilter>) -> Vec<Marker> {
    let mut out = Vec::new();
    let filter = filter.map(|f| f as &dyn chanfile::MarkerFilter);
    let mut cursor = TimeRange::new(0, MAX_TIME, usize::MAX, true, 0);
    chan.read_markers(store, &mut cursor, filter, &mut out).unwrap();
    out
}

#[test]
fn test_file_store_lifecycle() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("lifecycle.blocks");

    let events: Vec<Tick> = (0..1000).map(|i| i * 3 + 1).collect();
    let samples: Vec<i16> = (0..2000).map(|i| (i % 500) as i16 - 250).collect();
    let marks: Vec<Marker> = (0..300)
        .map(|i| Marker::with_codes(i * 7, [(i % 4) as u8, 0, 0, 0]))
        .collect();

    let event_config = ChannelConfig::events(ChannelKind::EventRise, 64);
    let wave_config = ChannelConfig::waveform(ChannelKind::Adc, 5, 256);
    let marker_config = ChannelConfig::markers(16);

    // Phase 1: file three channels into a fresh block file
    {
        let mut store = FileStore::create(&path, BLOCK, 256).unwrap();
        let mut ev = Channel::new(1, event_config.clone(), BLOCK).unwrap();
        let mut adc = Channel::new(2, wave_config.clone(), BLOCK).unwrap();
        let mut mk = Channel::new(3, marker_config.clone(), BLOCK).unwrap();

        for (i, chunk) in events.chunks(50).enumerate() {
            ev.write_events(&mut store, chunk).unwrap();
            let wave = &samples[i * 100..(i + 1) * 100];
            adc.write_wave(&mut store, wave, (i * 100 * 5) as Tick).unwrap();
            let from = (i * 15).min(marks.len());
            let upto = ((i + 1) * 15).min(marks.len());
            mk.write_markers(&mut store, &marks[from..upto]).unwrap();
        }

        // readable before anything is flushed
        assert_eq!(all_events(&ev, &store), events);

        for chan in [&mut ev, &mut adc, &mut mk] {
            chan.flush(&mut store).unwrap();
        }
        store.sync().unwrap();
        assert_eq!(store.channels(), vec![1, 2, 3]);
    }

    // Phase 2: reopen and read everything back through fresh channels
    {
        let store = FileStore::open(&path, BLOCK).unwrap();
        assert_eq!(store.channels(), vec![1, 2, 3]);

        let ev = Channel::new(1, event_config, BLOCK).unwrap();
        assert_eq!(all_events(&ev, &store), events);

        let mut cursor = TimeRange::new(0, MAX_TIME, 10, false, 0);
        assert_eq!(
            ev.prev_n_time(&store, &mut cursor, None).unwrap(),
            SearchOutcome::Found(events[990])
        );

        let adc = Channel::new(2, wave_config, BLOCK).unwrap();
        let mut out = vec![0i16; 3000];
        assert_eq!(adc.read_wave(&store, &mut out, 0, MAX_TIME).unwrap(), Some((2000, 0)));
        assert_eq!(&out[..2000], &samples[..]);

        let mk = Channel::new(3, marker_config, BLOCK).unwrap();
        assert_eq!(all_markers(&mk, &store, None), marks);

        // headers identify channel and kind
        for index in 0..store.block_count(3) {
            let header = BlockHeader::read(&store.load(3, index).unwrap()).unwrap();
            assert_eq!(header.chan, 3);
            assert_eq!(header.kind, BlockKind::Marker);
            assert!(header.first <= header.last);
        }
    }
}

#[test]
fn test_file_store_full() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("full.blocks");

    // two slots of 12 events each
    let mut store = FileStore::create(&path, 128, 2).unwrap();
    let mut chan = Channel::new(1, ChannelConfig::events(ChannelKind::EventRise, 4), 128).unwrap();
    let times: Vec<Tick> = (1..=100).collect();

    let err = chan.write_events(&mut store, &times).unwrap_err();
    assert!(matches!(err, ChanError::Store(StoreError::Full { max_blocks: 2 })));
    assert_eq!(store.free_slots(), 0);
}

#[test]
fn test_reopen_rejects_wrong_block_size() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("sized.blocks");
    drop(FileStore::create(&path, 1024, 3).unwrap());

    let err = FileStore::open(&path, 1000).unwrap_err();
    assert!(matches!(err, ChanError::Store(StoreError::Corrupted { .. })));
}

#[test]
fn test_channels_share_a_store() {
    let mut store = MemStore::new(BLOCK);
    let mut a = Channel::new(1, ChannelConfig::events(ChannelKind::EventFall, 8), BLOCK).unwrap();
    let mut b = Channel::new(2, ChannelConfig::events(ChannelKind::EventFall, 8), BLOCK).unwrap();

    for i in 0..200 {
        a.write_events(&mut store, &[i * 2]).unwrap();
        b.write_events(&mut store, &[i * 2 + 1]).unwrap();
    }
    a.flush(&mut store).unwrap();
    b.flush(&mut store).unwrap();

    assert_eq!(all_events(&a, &store), (0..200).map(|i| i * 2).collect::<Vec<Tick>>());
    assert_eq!(all_events(&b, &store), (0..200).map(|i| i * 2 + 1).collect::<Vec<Tick>>());
    assert_eq!(store.block_count(1), store.block_count(2));
}

#[test]
fn test_backward_search_agrees_with_forward_read() {
    let mut store = MemStore::new(128);
    let mut chan = Channel::new(1, ChannelConfig::markers(8), 128).unwrap();
    let marks: Vec<Marker> = (0..40)
        .map(|i| Marker::with_codes(i * 10, [(i % 6) as u8, 0, 0, 0]))
        .collect();
    chan.write_markers(&mut store, &marks).unwrap();

    let check = |chan: &Channel, store: &MemStore| {
        for pattern in 0u32..(1 << 6) {
            let codes: Vec<u8> = (0..6u8).filter(|c| pattern & (1 << c) != 0).collect();
            let filter = CodeFilter::only_codes(&codes);
            let kept: Vec<Tick> =
                all_markers(chan, store, Some(&filter)).iter().map(|m| m.time).collect();
            let expected: Vec<Tick> = marks
                .iter()
                .filter(|m| codes.contains(&m.code(0)))
                .map(|m| m.time)
                .collect();
            assert_eq!(kept, expected, "pattern {pattern:06b}");

            for k in 1..=kept.len() + 1 {
                let mut cursor = TimeRange::new(0, MAX_TIME, k, false, 0);
                let outcome = chan.prev_n_time(store, &mut cursor, Some(&filter)).unwrap();
                if k <= kept.len() {
                    assert_eq!(
                        outcome,
                        SearchOutcome::Found(kept[kept.len() - k]),
                        "pattern {pattern:06b} k {k}"
                    );
                } else {
                    assert_eq!(outcome, SearchOutcome::NotFound, "pattern {pattern:06b} k {k}");
                }
            }
        }
    };

    // split across store blocks, write block and buffer
    assert!(store.block_count(1) > 1);
    check(&chan, &store);

    // committed data still buffered is seen once
    chan.flush(&mut store).unwrap();
    check(&chan, &store);
}

#[test]
fn test_backward_search_yields_across_layers() {
    let mut store = MemStore::new(128);
    let mut chan = Channel::new(1, ChannelConfig::markers(8), 128).unwrap();
    let marks: Vec<Marker> = (1..=60)
        .map(|i| Marker::with_codes(i, [(i % 2) as u8, 0, 0, 0]))
        .collect();
    chan.write_markers(&mut store, &marks).unwrap();

    let filter = CodeFilter::only_codes(&[1]);
    let mut cursor = TimeRange::new(0, MAX_TIME, 20, false, 3);
    let mut calls = 0;
    let found = loop {
        calls += 1;
        match chan.prev_n_time(&store, &mut cursor, Some(&filter)).unwrap() {
            SearchOutcome::CallAgain => {}
            other => break other,
        }
    };
    assert!(calls > 1);
    // odd times 59, 57, ... the 20th is 21
    assert_eq!(found, SearchOutcome::Found(21));
}

#[test]
fn test_discarded_spans_never_reach_the_store() {
    let mut store = MemStore::new(BLOCK);
    let mut chan =
        Channel::new(1, ChannelConfig::events(ChannelKind::EventRise, 16), BLOCK).unwrap();

    // alternate 100-tick spans of saving and discarding
    for t in (0..1000).step_by(100) {
        chan.set_save(t, (t / 100) % 2 == 0);
    }
    assert_eq!(chan.no_save_list(0, 400, 10), vec![100..200, 300..400]);

    let times: Vec<Tick> = (0..1000).step_by(5).collect();
    chan.write_events(&mut store, &times).unwrap();
    chan.flush(&mut store).unwrap();

    // a fresh channel sees only what was filed
    let reader = Channel::new(1, ChannelConfig::events(ChannelKind::EventRise, 16), BLOCK).unwrap();
    let filed = all_events(&reader, &store);
    let expected: Vec<Tick> = times.iter().copied().filter(|t| (t / 100) % 2 == 0).collect();
    assert_eq!(filed, expected);
}

#[test]
fn test_retrospective_save_before_drain() {
    let mut store = MemStore::new(BLOCK);
    let config = ChannelConfig::events(ChannelKind::EventRise, 32).discarding();
    let mut chan = Channel::new(1, config.clone(), BLOCK).unwrap();
    assert!(!chan.is_saving(0));

    let times: Vec<Tick> = (0..30).map(|i| i * 10).collect();
    chan.write_events(&mut store, &times).unwrap();
    assert_eq!(store.block_count(1), 0);

    // decided after the data arrived
    chan.save_range(100, 200);
    chan.flush(&mut store).unwrap();

    let reader = Channel::new(1, config, BLOCK).unwrap();
    assert_eq!(all_events(&reader, &store), (10..20).map(|i| i * 10).collect::<Vec<Tick>>());
}

#[test]
fn test_waveform_gap_splits_reads() {
    let mut store = MemStore::new(BLOCK);
    let config = ChannelConfig::waveform(ChannelKind::RealWave, 10, 64);
    let mut chan = Channel::new(1, config, BLOCK).unwrap();

    let first: Vec<f32> = (0..300).map(|i| i as f32 * 0.5).collect();
    let second: Vec<f32> = (0..100).map(|i| -(i as f32)).collect();
    chan.write_wave(&mut store, &first, 0).unwrap();
    chan.write_wave(&mut store, &second, 5000).unwrap();

    let mut out = vec![0f32; 1000];
    // contiguous run up to the gap
    assert_eq!(chan.read_wave(&store, &mut out, 0, MAX_TIME).unwrap(), Some((300, 0)));
    assert_eq!(&out[..300], &first[..]);

    // a read starting inside the gap snaps to the next run
    assert_eq!(chan.read_wave(&store, &mut out, 3001, MAX_TIME).unwrap(), Some((100, 5000)));
    assert_eq!(&out[..100], &second[..]);

    // so does one starting after the last sample of the first run, before it ends
    for flushed in [false, true] {
        if flushed {
            chan.flush(&mut store).unwrap();
        }
        assert_eq!(chan.read_wave(&store, &mut out, 2995, Tick::MAX).unwrap(), Some((100, 5000)));
        assert_eq!(chan.read_wave(&store, &mut out, 2991, 2999).unwrap(), None);
    }

    // nth sample back, counting across the gap
    let mut cursor = TimeRange::new(0, MAX_TIME, 101, false, 0);
    assert_eq!(chan.prev_n_time(&store, &mut cursor, None).unwrap(), SearchOutcome::Found(2990));
}

#[test]
fn test_event_levels_alternate() {
    let mut store = MemStore::new(BLOCK);
    let mut chan =
        Channel::new(1, ChannelConfig::events(ChannelKind::EventBoth, 4), BLOCK).unwrap();

    chan.write_events(&mut store, &[10, 20, 30, 40, 50, 60]).unwrap();
    // only 10 and 20 were drained, so 60 is still uncommitted
    chan.write_events(&mut store, &[60]).unwrap();
    chan.flush(&mut store).unwrap();
    assert_eq!(all_events(&chan, &store), vec![10, 20, 30, 40, 50]);
}
