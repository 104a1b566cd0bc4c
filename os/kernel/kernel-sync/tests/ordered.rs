use kernel_sync::{LockToken, OrderedLock, Unlocked, lock_order};
use std::sync::{Arc, Barrier};
use std::thread;

struct Object;
struct Controller;
struct Tables;
lock_order!(Unlocked => Object => Controller => Tables);

#[test]
fn nested_acquisition_in_declared_order() {
    let object = OrderedLock::<Object, _>::new(10_u32);
    let controller = OrderedLock::<Controller, _>::new(20_u32);
    let tables = OrderedLock::<Tables, _>::new(30_u32);

    let root = LockToken::root();
    let mut o = object.lock(&root);
    let (o_value, o_token) = o.split();
    let mut c = controller.lock(o_token);
    let (c_value, c_token) = c.split();
    let t = tables.lock(c_token);

    *o_value += *t;
    *c_value += *t;
    drop(t);
    drop(c);
    assert_eq!(*o, 40);
    drop(o);
    assert_eq!(*controller.lock(&root), 50);
}

#[test]
fn levels_may_be_skipped() {
    let object = OrderedLock::<Object, _>::new(());
    let tables = OrderedLock::<Tables, _>::new(1_u8);

    let root = LockToken::root();
    let o = object.lock(&root);
    assert_eq!(*tables.lock(o.token()), 1);
}

#[test]
fn sibling_locks_under_one_parent() {
    let object = OrderedLock::<Object, _>::new(());
    let views = [
        OrderedLock::<Controller, _>::new(1_u32),
        OrderedLock::<Controller, _>::new(2_u32),
        OrderedLock::<Controller, _>::new(3_u32),
    ];

    let root = LockToken::root();
    let o = object.lock(&root);
    let sum: u32 = views.iter().map(|v| *v.lock(o.token())).sum();
    assert_eq!(sum, 6);
}

#[test]
fn is_locked_reflects_guard() {
    let object = OrderedLock::<Object, _>::new(0_u8);
    let root = LockToken::root();
    assert!(!object.is_locked());
    let g = object.lock(&root);
    assert!(object.is_locked());
    drop(g);
    assert!(!object.is_locked());
}

#[test]
fn ordered_locks_exclude_across_threads() {
    let threads = 4;
    let iters = 2_000;

    let object = Arc::new(OrderedLock::<Object, _>::new(0_usize));
    let controller = Arc::new(OrderedLock::<Controller, _>::new(0_usize));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let object = Arc::clone(&object);
            let controller = Arc::clone(&controller);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    let root = LockToken::root();
                    let mut o = object.lock(&root);
                    let (o_value, o_token) = o.split();
                    let mut c = controller.lock(o_token);
                    *o_value += 1;
                    *c += 2;
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let root = LockToken::root();
    assert_eq!(*object.lock(&root), threads * iters);
    assert_eq!(*controller.lock(&root), 2 * threads * iters);
}
