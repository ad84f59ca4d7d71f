use woolhat::{Domain, HashValue, Witchhat, Woolhat};

fn h(n: u64) -> HashValue {
    HashValue::new(n as u128)
}

#[test]
fn serial_sanity() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Woolhat<usize> = Woolhat::new(&domain);

    for i in 1..=1000u64 {
        assert_eq!(t.put(&mut ctx, h(i), 0x10 * i as usize), None);
    }
    assert_eq!(t.len(), 1000);

    let view = t.view(&mut ctx, true);
    assert_eq!(view.len(), 1000);
    let items: Vec<usize> = view.iter().map(|&(item, _)| item).collect();
    let expected: Vec<usize> = (1..=1000).map(|i| 0x10 * i).collect();
    assert_eq!(items, expected);
    for pair in view.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "sort epochs must be non-decreasing");
    }

    for i in 1..=500u64 {
        assert_eq!(t.remove(&mut ctx, h(i)), Some(0x10 * i as usize));
    }
    assert_eq!(t.len(), 500);
    let view = t.view(&mut ctx, true);
    assert_eq!(view.len(), 500);
    assert!(view.iter().all(|&(item, _)| item > 0x10 * 500));

    for i in 1..=500u64 {
        assert_eq!(t.get(&mut ctx, h(i)), None);
    }
    for i in 501..=1000u64 {
        assert_eq!(t.get(&mut ctx, h(i)), Some(0x10 * i as usize));
    }
}

#[test]
fn put_put_get() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    assert_eq!(t.put(&mut ctx, h(9), 'a'), None);
    assert_eq!(t.put(&mut ctx, h(9), 'b'), Some('a'));
    assert_eq!(t.get(&mut ctx, h(9)), Some('b'));
    assert_eq!(t.len(), 1);
}

#[test]
fn add_only_succeeds_when_absent() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    assert_eq!(t.add(&mut ctx, h(3), 'v'), Ok(()));
    assert_eq!(t.add(&mut ctx, h(3), 'w'), Err('w'));
    assert_eq!(t.get(&mut ctx, h(3)), Some('v'));

    assert_eq!(t.remove(&mut ctx, h(3)), Some('v'));
    assert_eq!(t.add(&mut ctx, h(3), 'w'), Ok(()));
    assert_eq!(t.get(&mut ctx, h(3)), Some('w'));
}

#[test]
fn put_remove_get() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    t.put(&mut ctx, h(5), 42u32);
    assert_eq!(t.remove(&mut ctx, h(5)), Some(42));
    assert_eq!(t.get(&mut ctx, h(5)), None);
    assert_eq!(t.remove(&mut ctx, h(5)), None);
    assert_eq!(t.len(), 0);
}

#[test]
fn replace_requires_live_entry() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    assert_eq!(t.replace(&mut ctx, h(7), 1u8), Err(1));
    t.put(&mut ctx, h(7), 2u8);
    assert_eq!(t.replace(&mut ctx, h(7), 3u8), Ok(2));
    assert_eq!(t.get(&mut ctx, h(7)), Some(3));

    t.remove(&mut ctx, h(7));
    assert_eq!(t.replace(&mut ctx, h(7), 4u8), Err(4));
}

#[test]
fn overwrite_keeps_iteration_position() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    t.put(&mut ctx, h(1), "one");
    t.put(&mut ctx, h(2), "two");
    t.put(&mut ctx, h(1), "one again");

    let items: Vec<&str> = t.view(&mut ctx, true).into_iter().map(|(i, _)| i).collect();
    assert_eq!(items, ["one again", "two"]);
}

#[test]
fn reinsert_moves_to_the_end() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t = Woolhat::new(&domain);

    t.put(&mut ctx, h(1), "one");
    t.put(&mut ctx, h(2), "two");
    t.remove(&mut ctx, h(1));
    assert_eq!(t.add(&mut ctx, h(1), "one reborn"), Ok(()));

    let items: Vec<&str> = t.view(&mut ctx, true).into_iter().map(|(i, _)| i).collect();
    assert_eq!(items, ["two", "one reborn"]);
}

#[test]
fn growth_keeps_every_entry() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Woolhat<u64> = Woolhat::new(&domain);

    let initial = t.capacity(&mut ctx);
    for i in 1..=200u64 {
        t.put(&mut ctx, h(i), i);
    }
    assert!(t.capacity(&mut ctx) > initial);
    assert_eq!(t.len(), 200);
    for i in 1..=200u64 {
        assert_eq!(t.get(&mut ctx, h(i)), Some(i));
    }
}

#[test]
fn with_size_clamps_to_minimum() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Woolhat<u8> = Woolhat::with_size(&domain, 1);
    assert_eq!(t.capacity(&mut ctx), 1 << woolhat::MIN_SIZE_LOG);
}

#[test]
fn view_epoch_shares_one_instant_across_tables() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let a: Woolhat<u32> = Woolhat::new(&domain);
    let b: Woolhat<u32> = Woolhat::new(&domain);

    a.put(&mut ctx, h(1), 10);
    b.put(&mut ctx, h(2), 20);

    let (va, vb) = ctx.with_linearized(|ctx, epoch| {
        // writes inside the window land after the shared epoch and stay
        // invisible to both snapshots
        a.put(ctx, h(3), 30);
        b.put(ctx, h(4), 40);
        (a.view_epoch(ctx, epoch, true), b.view_epoch(ctx, epoch, true))
    });

    let items_a: Vec<u32> = va.iter().map(|&(_, item, _)| item).collect();
    let items_b: Vec<u32> = vb.iter().map(|&(_, item, _)| item).collect();
    assert_eq!(items_a, [10]);
    assert_eq!(items_b, [20]);

    assert_eq!(a.get(&mut ctx, h(3)), Some(30));
    assert_eq!(b.get(&mut ctx, h(4)), Some(40));
}

#[test]
fn view_reports_hashes() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Woolhat<u64> = Woolhat::new(&domain);
    for i in 1..=20u64 {
        t.put(&mut ctx, h(i), i);
    }
    let entries = ctx.with_linearized(|ctx, epoch| t.view_epoch(ctx, epoch, false));
    assert_eq!(entries.len(), 20);
    for (hv, item, _) in entries {
        assert_eq!(hv, h(item));
    }
}

#[test]
#[should_panic(expected = "all-zero hash")]
fn zero_hash_is_rejected() {
    let _ = HashValue::new(0);
}

#[test]
fn witchhat_basics() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Witchhat<usize> = Witchhat::new(&domain);

    for i in 1..=100u64 {
        assert_eq!(t.put(&mut ctx, h(i), i as usize), None);
    }
    assert_eq!(t.len(), 100);
    assert_eq!(t.put(&mut ctx, h(50), 5000), Some(50));
    assert_eq!(t.get(&mut ctx, h(50)), Some(5000));

    assert_eq!(t.add(&mut ctx, h(50), 1), Err(1));
    assert_eq!(t.replace(&mut ctx, h(200), 1), Err(1));
    assert_eq!(t.replace(&mut ctx, h(1), 11), Ok(1));

    assert_eq!(t.remove(&mut ctx, h(1)), Some(11));
    assert_eq!(t.remove(&mut ctx, h(1)), None);
    assert_eq!(t.len(), 99);

    let view = t.view(&mut ctx, true);
    assert_eq!(view.len(), 99);
    for pair in view.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
}

#[test]
fn witchhat_growth() {
    let domain = Domain::new();
    let mut ctx = domain.register();
    let t: Witchhat<u64> = Witchhat::new(&domain);

    let initial = t.capacity(&mut ctx);
    for i in 1..=300u64 {
        t.put(&mut ctx, h(i), i);
    }
    assert!(t.capacity(&mut ctx) > initial);
    for i in 1..=300u64 {
        assert_eq!(t.get(&mut ctx, h(i)), Some(i));
    }
}

#[test]
fn contexts_are_tied_to_their_domain() {
    let domain_a = Domain::new();
    let domain_b = Domain::new();
    let mut ctx_b = domain_b.register();
    let t: Woolhat<u8> = Woolhat::new(&domain_a);

    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        t.get(&mut ctx_b, h(1));
    }));
    assert!(err.is_err());
}
