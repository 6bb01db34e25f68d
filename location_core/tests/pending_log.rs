use location_core::{coalesce, ChangeOp, LocationKey, PendingChanges, Transition, WorldId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn key(x: i32) -> LocationKey {
    LocationKey::at(&WorldId::new("w1"), x, 64, 0)
}

/// Whether a block is stored after applying `op` to a coordinate whose stored
/// presence was `initially_present`. Panics on a contradiction.
fn stored_after(initially_present: bool, op: Option<ChangeOp>) -> bool {
    match op {
        None => initially_present,
        Some(ChangeOp::Insert) => {
            assert!(!initially_present, "insert pending over a stored row");
            true
        }
        Some(ChangeOp::Update) => {
            assert!(initially_present, "update pending without a stored row");
            true
        }
        Some(ChangeOp::Delete) => {
            assert!(initially_present, "delete pending without a stored row");
            false
        }
    }
}

#[test]
fn coalescing_table_is_complete() {
    use ChangeOp::{Delete, Insert, Update};
    let expected = [
        (None, Insert, Transition::Store(Insert)),
        (None, Update, Transition::Store(Update)),
        (None, Delete, Transition::Store(Delete)),
        (Some(Insert), Insert, Transition::Unexpected),
        (Some(Insert), Update, Transition::Keep),
        (Some(Insert), Delete, Transition::Drop),
        (Some(Update), Insert, Transition::Unexpected),
        (Some(Update), Update, Transition::Keep),
        (Some(Update), Delete, Transition::Store(Delete)),
        (Some(Delete), Insert, Transition::Store(Update)),
        (Some(Delete), Update, Transition::Unexpected),
        (Some(Delete), Delete, Transition::Keep),
    ];
    for (existing, incoming, transition) in expected {
        assert_eq!(
            coalesce(existing, incoming),
            transition,
            "{existing:?} then {incoming}"
        );
    }
}

#[test]
fn pending_entry_reproduces_net_effect_of_random_histories() {
    let mut rng = SmallRng::seed_from_u64(0x5eed_b10c);

    for round in 0..500 {
        let mut log = PendingChanges::new();
        let coords: usize = rng.gen_range(1..6);
        let initial: Vec<bool> = (0..coords).map(|_| rng.gen_bool(0.5)).collect();
        let mut present = initial.clone();

        for _ in 0..rng.gen_range(0..20) {
            let x = rng.gen_range(0..coords);
            let op = if !present[x] {
                present[x] = true;
                ChangeOp::Insert
            } else if rng.gen_bool(0.5) {
                ChangeOp::Update
            } else {
                present[x] = false;
                ChangeOp::Delete
            };
            let transition = log.record(op, &key(x as i32));
            assert_ne!(transition, Transition::Unexpected, "round {round}");
        }

        for x in 0..coords {
            assert_eq!(
                stored_after(initial[x], log.get(&key(x as i32))),
                present[x],
                "round {round}, coordinate {x}"
            );
        }
    }
}

#[test]
fn drain_empties_the_log_in_key_order() {
    let mut log = PendingChanges::new();
    log.record(ChangeOp::Update, &key(3));
    log.record(ChangeOp::Insert, &key(1));
    log.record(ChangeOp::Delete, &key(2));

    let drained = log.drain();
    let xs: Vec<i32> = drained.iter().map(|(key, _)| key.pos.x).collect();
    assert_eq!(xs, vec![1, 2, 3]);
    assert!(log.is_empty());
    assert!(log.drain().is_empty());
}
