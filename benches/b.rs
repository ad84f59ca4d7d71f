use criterion::{black_box, criterion_group, criterion_main, Criterion};
use woolhat::{Domain, HashValue, Witchhat, Woolhat};

fn h(n: u64) -> HashValue {
    HashValue::new(n as u128)
}

fn woolhat_put_get(n: u64, m: u64) {
    let domain = Domain::new();
    let t: Woolhat<u64> = Woolhat::new(&domain);

    std::thread::scope(|s| {
        for tid in 0..m {
            let domain = domain.clone();
            let t = &t;
            s.spawn(move || {
                let mut ctx = domain.register();
                let base = 1 + tid * n;
                for i in 0..n {
                    t.put(&mut ctx, h(base + i), i);
                }
                for i in 0..n {
                    black_box(t.get(&mut ctx, h(base + i)));
                }
            });
        }
    });
}

fn woolhat_view_under_writes(n: u64, m: u64) {
    let domain = Domain::new();
    let t: Woolhat<u64> = Woolhat::new(&domain);

    std::thread::scope(|s| {
        for tid in 0..m {
            let domain = domain.clone();
            let t = &t;
            s.spawn(move || {
                let mut ctx = domain.register();
                for i in 0..n {
                    t.put(&mut ctx, h(1 + (i % 64)), tid);
                }
            });
        }
        let domain = domain.clone();
        let t = &t;
        s.spawn(move || {
            let mut ctx = domain.register();
            for _ in 0..n / 10 {
                black_box(t.view(&mut ctx, true));
            }
        });
    });
}

fn witchhat_put_get(n: u64, m: u64) {
    let domain = Domain::new();
    let t: Witchhat<u64> = Witchhat::new(&domain);

    std::thread::scope(|s| {
        for tid in 0..m {
            let domain = domain.clone();
            let t = &t;
            s.spawn(move || {
                let mut ctx = domain.register();
                let base = 1 + tid * n;
                for i in 0..n {
                    t.put(&mut ctx, h(base + i), i);
                }
                for i in 0..n {
                    black_box(t.get(&mut ctx, h(base + i)));
                }
            });
        }
    });
}

fn woolhat_n1000_m4(c: &mut Criterion) {
    c.bench_function("woolhat_put_get_n1000_m4", |b| {
        b.iter(|| woolhat_put_get(black_box(1000), 4))
    });
}

fn woolhat_view_n1000_m4(c: &mut Criterion) {
    c.bench_function("woolhat_view_n1000_m4", |b| {
        b.iter(|| woolhat_view_under_writes(black_box(1000), 4))
    });
}

fn witchhat_n1000_m4(c: &mut Criterion) {
    c.bench_function("witchhat_put_get_n1000_m4", |b| {
        b.iter(|| witchhat_put_get(black_box(1000), 4))
    });
}

criterion_group!(benches, woolhat_n1000_m4, woolhat_view_n1000_m4, witchhat_n1000_m4);
criterion_main!(benches);
