//! Behavioural tests for closures and the static registry: wire round-trips,
//! force idempotence, and combinator reconstruction.
//!
//! The registry is process-wide and seals once, so every label used anywhere
//! in this binary is registered in one `setup` guarded by `Once`.

use std::sync::Once;

use shoal_closure::{
    apply, codec, compose, fn_closure, register_apply, register_builtins, register_compose,
    register_fn, registry, to_closure, Closure, FnThunk, WireForm,
};

fn add_one(x: i64) -> i64 {
    x + 1
}

fn double(x: i64) -> i64 {
    x * 2
}

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        register_builtins().unwrap();
        register_fn("tests::add_one", add_one as fn(i64) -> i64).unwrap();
        register_fn("tests::double", double as fn(i64) -> i64).unwrap();
        register_apply::<i64, i64>().unwrap();
        register_compose::<i64, i64, i64>().unwrap();
        registry::seal();
    });
}

fn ship<T>(c: &Closure<T>) -> Closure<T> {
    let bytes = codec::encode(c).unwrap();
    codec::decode(&bytes).unwrap()
}

// ── Wire form layout ──────────────────────────────────────────────────────────

#[test]
fn wire_form_byte_layout() {
    let w = WireForm {
        label: "ab".to_string(),
        payload: vec![9, 8, 7],
    };
    let bytes = w.to_bytes().unwrap();
    assert_eq!(&bytes[..2], &[0, 2], "2-byte big-endian label length");
    assert_eq!(&bytes[2..4], b"ab");
    assert_eq!(&bytes[4..], &[9, 8, 7]);
    assert_eq!(WireForm::from_bytes(&bytes).unwrap(), w);
}

#[test]
fn wire_form_rejects_truncation() {
    let w = WireForm {
        label: "some.label".to_string(),
        payload: vec![],
    };
    let bytes = w.to_bytes().unwrap();
    assert!(WireForm::from_bytes(&bytes[..4]).is_err());
    assert!(WireForm::from_bytes(&[0]).is_err());
}

// ── Value closures ────────────────────────────────────────────────────────────

#[test]
fn value_closure_roundtrip() {
    setup();
    let c = to_closure(&42i64).unwrap();
    let shipped = ship(&c);
    assert!(!shipped.is_materialized(), "wire closures arrive unmaterialised");
    assert_eq!(shipped.value().unwrap(), 42);
    assert!(shipped.is_materialized());
}

#[test]
fn string_closure_roundtrip() {
    setup();
    let c = to_closure(&"spark".to_string()).unwrap();
    assert_eq!(ship(&c).value().unwrap(), "spark");
}

#[test]
fn registry_miss_is_fatal_error() {
    setup();
    let orphan: Closure<i64> = Closure::from_wire(WireForm {
        label: "tests::never_registered".to_string(),
        payload: vec![],
    });
    let err = orphan.thunk().unwrap_err();
    assert!(matches!(err, shoal_closure::ClosureError::RegistryMiss(_)));
}

// ── Force ─────────────────────────────────────────────────────────────────────

#[test]
fn force_rewrites_wire_to_value_encoding() {
    setup();
    let f = fn_closure("tests::add_one", add_one as fn(i64) -> i64);
    let c = apply(&f, &to_closure(&9i64).unwrap()).unwrap();
    assert!(c.label().starts_with("shoal.apply<"));

    let forced = c.force().unwrap();
    assert_eq!(forced.label(), shoal_closure::value_label::<i64>());
    assert_eq!(forced.value().unwrap(), 10);
    // The forced payload IS the value: shipping it decodes without the
    // application combinator being consulted again.
    assert_eq!(ship(&forced).value().unwrap(), 10);
}

#[test]
fn force_is_idempotent() {
    setup();
    let f = fn_closure("tests::double", double as fn(i64) -> i64);
    let c = apply(&f, &to_closure(&21i64).unwrap()).unwrap();
    let once = c.force().unwrap();
    let twice = once.force().unwrap();
    assert_eq!(once.wire(), twice.wire());
    assert_eq!(once.value().unwrap(), twice.value().unwrap());
}

#[test]
fn force_preserves_thunk_value() {
    setup();
    let f = fn_closure("tests::double", double as fn(i64) -> i64);
    let c = apply(&f, &to_closure(&5i64).unwrap()).unwrap();
    assert_eq!(c.force().unwrap().value().unwrap(), c.value().unwrap());
}

// ── Full normal form ──────────────────────────────────────────────────────────

#[test]
fn force_nf_is_identity_on_plain_data() {
    use shoal_closure::ForceNf;
    assert_eq!(5i64.force_nf().unwrap(), 5);
    assert_eq!("abc".to_string().force_nf().unwrap(), "abc");
    assert_eq!(vec![1u64, 2, 3].force_nf().unwrap(), vec![1, 2, 3]);
}

#[test]
fn force_nf_reaches_closures_nested_in_a_vec() {
    use shoal_closure::ForceNf;
    setup();
    let f = fn_closure("tests::add_one", add_one as fn(i64) -> i64);
    let nested: Vec<Closure<i64>> = vec![
        apply(&f, &to_closure(&1i64).unwrap()).unwrap(),
        apply(&f, &to_closure(&2i64).unwrap()).unwrap(),
    ];
    assert!(nested[0].label().starts_with("shoal.apply<"));

    let normal = nested.force_nf().unwrap();
    for (i, c) in normal.iter().enumerate() {
        assert_eq!(c.label(), shoal_closure::value_label::<i64>());
        assert_eq!(c.value().unwrap(), i as i64 + 2);
    }
    // The originals are untouched.
    assert!(nested[1].label().starts_with("shoal.apply<"));
}

#[test]
fn force_nf_on_a_closure_of_closures_normalises_every_level() {
    use shoal_closure::ForceNf;
    setup();
    let f = fn_closure("tests::double", double as fn(i64) -> i64);
    let inner = apply(&f, &to_closure(&4i64).unwrap()).unwrap();
    let outer = to_closure(&vec![inner]).unwrap();

    let normal = outer.force_nf().unwrap();
    assert_eq!(normal.label(), shoal_closure::value_label::<Vec<Closure<i64>>>());
    let items = normal.value().unwrap();
    assert_eq!(items[0].label(), shoal_closure::value_label::<i64>());
    assert_eq!(items[0].value().unwrap(), 8);
}

// ── Application and composition ───────────────────────────────────────────────

#[test]
fn apply_evaluates_on_the_receiving_side() {
    setup();
    let f = fn_closure("tests::add_one", add_one as fn(i64) -> i64);
    let c = apply(&f, &to_closure(&1i64).unwrap()).unwrap();
    // Ship the *unevaluated* application; the receiver rebuilds it from the
    // registry and only then runs it.
    let shipped = ship(&c);
    assert_eq!(shipped.value().unwrap(), 2);
}

#[test]
fn compose_roundtrip_applies_right_then_left() {
    setup();
    let g = fn_closure("tests::add_one", add_one as fn(i64) -> i64);
    let f = fn_closure("tests::double", double as fn(i64) -> i64);
    let gf = compose(&g, &f).unwrap();
    let shipped = ship(&gf);
    let thunk: &FnThunk<i64, i64> = shipped.thunk().unwrap();
    // (add_one ∘ double)(10) = 21, not 22
    assert_eq!((thunk.0)(10), 21);
}

#[test]
fn nested_apply_through_compose() {
    setup();
    let g = fn_closure("tests::add_one", add_one as fn(i64) -> i64);
    let f = fn_closure("tests::double", double as fn(i64) -> i64);
    let gf = compose(&g, &f).unwrap();
    let c = apply(&gf, &to_closure(&4i64).unwrap()).unwrap();
    assert_eq!(ship(&c).value().unwrap(), 9);
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[test]
fn sealed_registry_rejects_new_labels() {
    setup();
    let err = registry::register(
        "tests::late_arrival",
        Box::new(|_| Ok(Box::new(0i64) as Box<dyn std::any::Any + Send + Sync>)),
    )
    .unwrap_err();
    assert!(matches!(err, shoal_closure::ClosureError::Sealed(_)));
}

#[test]
fn labels_dump_is_sorted_and_contains_builtins() {
    setup();
    let labels = registry::labels();
    let mut sorted = labels.clone();
    sorted.sort();
    assert_eq!(labels, sorted);
    assert!(labels.contains(&shoal_closure::value_label::<i64>()));
}
