//! Snapshot store under concurrent writers and readers.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use netscope_agent::{Mutation, SnapshotStore};

#[test]
fn concurrent_mutations_are_never_torn() {
    let store = Arc::new(SnapshotStore::new(64));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = store.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            loop {
                let finished = done.load(Ordering::Relaxed);
                let s = store.read();
                // both halves of a Totals mutation land together
                assert_eq!(s.sent_bytes, s.recv_bytes);
                // a rate and its history point land together
                if let Some(last) = s.history.last() {
                    assert_eq!(last.download_mbps, s.download_bps / 1e6);
                    assert_eq!(last.upload_mbps, s.upload_bps / 1e6);
                }
                assert!(s.history.len() <= 64);
                reads += 1;
                if finished {
                    return reads;
                }
            }
        })
    };

    let writers: Vec<_> = (0..8u64)
        .map(|w| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500u64 {
                    let v = w * 10_000 + i;
                    store.apply(Mutation::Totals {
                        sent_bytes: v,
                        recv_bytes: v,
                    });
                    store.apply(Mutation::RateTick {
                        download_bps: v as f64 * 3.0,
                        upload_bps: v as f64,
                        elapsed_seconds: i as f64,
                    });
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);

    assert_eq!(store.version(), 8 * 500 * 2);
    assert_eq!(store.history_len(), 64);
    let s = store.read();
    assert!(s.history.windows(2).all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds));
}

#[test]
fn history_keeps_the_last_capacity_points_in_order() {
    let cap = 10;
    let extra = 7;
    let store = SnapshotStore::new(cap);
    for i in 0..cap + extra {
        store.apply(Mutation::RateTick {
            download_bps: i as f64 * 1e6,
            upload_bps: 0.0,
            elapsed_seconds: i as f64,
        });
    }
    let h = store.read().history;
    assert_eq!(h.len(), cap);
    let got: Vec<f64> = h.iter().map(|p| p.elapsed_seconds).collect();
    let want: Vec<f64> = (extra..cap + extra).map(|i| i as f64).collect();
    assert_eq!(got, want);
    assert_eq!(h[0].download_mbps, extra as f64);

    // a consumer that started at zero sees what it missed
    let delta = store.history_since(0);
    assert_eq!(delta.missed, extra as u64);
    assert_eq!(delta.points.len(), cap);
}
