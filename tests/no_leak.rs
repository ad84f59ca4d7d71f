use std::sync::Arc;

use woolhat::{Domain, HashValue, Witchhat, Woolhat};

fn h(n: u64) -> HashValue {
    HashValue::new(n as u128)
}

#[test]
fn no_leak() {
    let vals: Vec<Arc<usize>> = (0..5usize).map(Arc::new).collect();

    {
        let domain = Domain::new();
        let mut ctx = domain.register();
        let t: Woolhat<Arc<usize>> = Woolhat::new(&domain);

        t.put(&mut ctx, h(1), vals[0].clone());
        t.put(&mut ctx, h(1), vals[1].clone()); // displaces vals[0]
        t.put(&mut ctx, h(2), vals[2].clone());
        assert_eq!(t.remove(&mut ctx, h(1)).as_deref(), Some(&1));
        t.add(&mut ctx, h(3), vals[3].clone()).unwrap();
        assert_eq!(
            t.replace(&mut ctx, h(3), vals[4].clone()).as_deref(),
            Ok(&3)
        );

        // the table still pins the live copy
        assert!(Arc::strong_count(&vals[2]) >= 2);
        assert_eq!(*t.get(&mut ctx, h(2)).unwrap(), 2);

        drop(t);
        drop(ctx);
        drop(domain);
    }

    assert_eq!(
        vals.iter().map(Arc::strong_count).collect::<Vec<_>>(),
        [1, 1, 1, 1, 1]
    );
}

#[test]
fn no_leak_across_migrations() {
    let vals: Vec<Arc<u64>> = (0..512u64).map(Arc::new).collect();

    {
        let domain = Domain::new();
        let mut ctx = domain.register();
        let t: Woolhat<Arc<u64>> = Woolhat::new(&domain);

        for (i, v) in vals.iter().enumerate() {
            t.put(&mut ctx, h(i as u64 + 1), v.clone());
        }
        for i in 0..256u64 {
            t.remove(&mut ctx, h(i + 1));
        }
        // overwrite everything again to churn stores and chains some more
        for (i, v) in vals.iter().enumerate() {
            t.put(&mut ctx, h(i as u64 + 1), v.clone());
        }
        assert_eq!(t.len(), 512);

        drop(t);
        drop(ctx);
        drop(domain);
    }

    assert!(vals.iter().all(|v| Arc::strong_count(v) == 1));
}

#[test]
fn witchhat_no_leak() {
    let vals: Vec<Arc<usize>> = (0..3usize).map(Arc::new).collect();

    {
        let domain = Domain::new();
        let mut ctx = domain.register();
        let t: Witchhat<Arc<usize>> = Witchhat::new(&domain);

        t.put(&mut ctx, h(1), vals[0].clone());
        t.put(&mut ctx, h(1), vals[1].clone());
        t.put(&mut ctx, h(2), vals[2].clone());
        t.remove(&mut ctx, h(2));

        drop(t);
        drop(ctx);
        drop(domain);
    }

    assert_eq!(
        vals.iter().map(Arc::strong_count).collect::<Vec<_>>(),
        [1, 1, 1]
    );
}

#[test]
fn exiting_threads_hand_their_garbage_over() {
    let val = Arc::new(7usize);

    {
        let domain = Domain::new();
        let t: Woolhat<Arc<usize>> = Woolhat::new(&domain);

        // a context that retires displaced records and exits while another
        // registration is still live
        let mut outer = domain.register();
        {
            let mut ctx = domain.register();
            t.put(&mut ctx, h(9), val.clone());
            t.put(&mut ctx, h(9), val.clone());
            t.remove(&mut ctx, h(9));
        }
        assert_eq!(t.get(&mut outer, h(9)), None);

        drop(t);
        drop(outer);
        drop(domain);
    }

    assert_eq!(Arc::strong_count(&val), 1);
}
