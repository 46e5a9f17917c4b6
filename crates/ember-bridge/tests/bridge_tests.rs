//! Marshaling, identity, lifetime, and struct-registry tests.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_bridge::reflect::{
    ClassBuilder, ClassDescriptor, HostRegistry, HostValue, LocText, StructBuilder,
    StructDescriptor, Symbol, TypeKind,
};
use ember_bridge::script::MemoryAccount;
use ember_bridge::{BridgeError, Environment, RefKind};

fn point_class() -> Arc<ClassDescriptor> {
    ClassBuilder::new("Point")
        .field("x", TypeKind::Int32)
        .field("y", TypeKind::Int32)
        .build()
}

fn vector_struct() -> Arc<StructDescriptor> {
    StructBuilder::new("Vector")
        .field("x", TypeKind::Float32)
        .field("y", TypeKind::Float32)
        .build()
}

#[test]
fn test_proxy_identity_is_stable() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let handle = host.borrow_mut().create(&class);

    let a = env.obtain_proxy(handle).unwrap();
    let b = env.obtain_proxy(handle).unwrap();
    assert_eq!(a.raw(), b.raw());

    // Marshaling the same object also returns the same proxy.
    let c = env.make_value(&HostValue::Object(Some(handle))).unwrap();
    assert_eq!(a.raw(), c.raw());
}

#[test]
fn test_distinct_objects_distinct_proxies() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let h1 = host.borrow_mut().create(&class);
    let h2 = host.borrow_mut().create(&class);
    let p1 = env.obtain_proxy(h1).unwrap();
    let p2 = env.obtain_proxy(h2).unwrap();
    assert_ne!(p1.raw(), p2.raw());
}

#[test]
fn test_primitive_round_trips() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();

    let cases: Vec<(HostValue, TypeKind)> = vec![
        (HostValue::Bool(true), TypeKind::Bool),
        (HostValue::Bool(false), TypeKind::Bool),
        (HostValue::Int32(-12345), TypeKind::Int32),
        (HostValue::Int64(1 << 40), TypeKind::Int64),
        (HostValue::Float32(1.5), TypeKind::Float32),
        (HostValue::Float64(-2.25), TypeKind::Float64),
        (HostValue::Text("hello".into()), TypeKind::Text),
        (
            HostValue::LocText(LocText::literal("bonjour")),
            TypeKind::LocText,
        ),
        (HostValue::Name(Symbol::intern("BeginPlay")), TypeKind::Name),
    ];

    for (value, ty) in cases {
        let v = env.make_value(&value).unwrap();
        let back = env.read_value(v, &ty).unwrap();
        match (&value, &back) {
            (HostValue::Bool(a), HostValue::Bool(b)) => assert_eq!(a, b),
            (HostValue::Int32(a), HostValue::Int32(b)) => assert_eq!(a, b),
            (HostValue::Int64(a), HostValue::Int64(b)) => assert_eq!(a, b),
            (HostValue::Float32(a), HostValue::Float32(b)) => assert_eq!(a, b),
            (HostValue::Float64(a), HostValue::Float64(b)) => assert_eq!(a, b),
            (HostValue::Text(a), HostValue::Text(b)) => assert_eq!(a, b),
            (HostValue::LocText(a), HostValue::LocText(b)) => assert_eq!(a.text, b.text),
            (HostValue::Name(a), HostValue::Name(b)) => assert_eq!(a, b),
            (a, b) => panic!("kind changed across the boundary: {a:?} vs {b:?}"),
        }
    }
}

#[test]
fn test_int64_out_of_script_range_is_rejected() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let err = env.make_value(&HostValue::Int64(1 << 60));
    assert!(matches!(err, Err(BridgeError::TypeMismatch { .. })));
}

#[test]
fn test_shape_mismatch_is_rejected() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let v = env.make_value(&HostValue::Bool(true)).unwrap();
    let err = env.read_value(v, &TypeKind::Int32);
    assert!(matches!(err, Err(BridgeError::TypeMismatch { .. })));
    // Integral floats narrow; fractional floats do not.
    let whole = env.make_value(&HostValue::Float64(3.0)).unwrap();
    assert!(matches!(
        env.read_value(whole, &TypeKind::Int32).unwrap(),
        HostValue::Int32(3)
    ));
    let frac = env.make_value(&HostValue::Float64(3.5)).unwrap();
    assert!(matches!(
        env.read_value(frac, &TypeKind::Int32),
        Err(BridgeError::TypeMismatch { .. })
    ));
}

#[test]
fn test_stale_proxy_detection() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let handle = host.borrow_mut().create(&class);
    let proxy = env.obtain_proxy(handle).unwrap();

    assert_eq!(env.resolve_host_handle(proxy).unwrap(), handle);
    host.borrow_mut().destroy(handle).unwrap();
    assert!(matches!(
        env.resolve_host_handle(proxy),
        Err(BridgeError::StaleProxy)
    ));
    // Member access through the dispatcher surfaces the same condition as
    // a script-visible error.
    let err = env.get_member(proxy, "x");
    assert!(err.unwrap_err().to_string().contains("stale"));
}

#[test]
fn test_reverse_reference_balance() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let handle = host.borrow_mut().create(&class);
    let proxy = env.obtain_proxy(handle).unwrap();

    let id1 = env
        .create_reverse_reference(proxy, RefKind::Proxy, "test")
        .unwrap();
    let id2 = env
        .create_reverse_reference(proxy, RefKind::Proxy, "test")
        .unwrap();
    let id3 = env
        .create_reverse_reference(proxy, RefKind::Proxy, "test")
        .unwrap();
    // Repeated creation on the same value reuses the counted entry.
    assert_eq!(id1, id2);
    assert_eq!(id1, id3);

    for _ in 0..2 {
        env.release_reverse_reference(id1);
        assert!(env.reported_roots().contains(&handle));
    }
    env.release_reverse_reference(id1);
    assert!(!env.reported_roots().contains(&handle));
}

#[test]
fn test_double_release_is_nonfatal_and_isolated() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let kept = host.borrow_mut().create(&class);
    let dropped = host.borrow_mut().create(&class);
    let kept_proxy = env.obtain_proxy(kept).unwrap();
    let dropped_proxy = env.obtain_proxy(dropped).unwrap();

    let kept_id = env
        .create_reverse_reference(kept_proxy, RefKind::Proxy, "keep")
        .unwrap();
    let dropped_id = env
        .create_reverse_reference(dropped_proxy, RefKind::Proxy, "drop")
        .unwrap();
    env.release_reverse_reference(dropped_id);
    // Underflow: logged, ignored, and the other entry is untouched.
    env.release_reverse_reference(dropped_id);
    env.release_reverse_reference(dropped_id);
    let roots = env.reported_roots();
    assert!(roots.contains(&kept));
    assert!(!roots.contains(&dropped));
    let _ = kept_id;
    assert!(env.is_usable());
}

#[test]
fn test_reverse_reference_keeps_proxy_across_collection() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let handle = host.borrow_mut().create(&class);
    let proxy = env.obtain_proxy(handle).unwrap();
    let id = env
        .create_reverse_reference(proxy, RefKind::Proxy, "pin")
        .unwrap();

    env.collect_garbage().unwrap();
    // The pinned proxy survived, so identity is preserved.
    let again = env.obtain_proxy(handle).unwrap();
    assert_eq!(proxy.raw(), again.raw());

    env.release_reverse_reference(id);
    env.collect_garbage().unwrap();
    // The entry is gone; a fresh obtain recreates a live proxy.
    let fresh = env.obtain_proxy(handle).unwrap();
    assert_eq!(env.resolve_host_handle(fresh).unwrap(), handle);
}

#[test]
fn test_host_sweep_honors_reported_roots() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host.clone()).unwrap();
    let class = point_class();
    let referenced = host.borrow_mut().create(&class);
    let loose = host.borrow_mut().create(&class);

    let proxy = env.obtain_proxy(referenced).unwrap();
    env.create_reverse_reference(proxy, RefKind::Proxy, "script-held")
        .unwrap();

    let destroyed = {
        let roots = env.reported_roots();
        host.borrow_mut().sweep(&roots)
    };
    assert_eq!(destroyed, 1);
    assert!(host.borrow().is_valid(referenced));
    assert!(!host.borrow().is_valid(loose));
}

#[test]
fn test_owned_struct_copy_is_independent() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let vec2 = vector_struct();
    env.register_struct_type(&vec2);

    let mut source = Vec::new();
    source.extend_from_slice(&1.0f32.to_le_bytes());
    source.extend_from_slice(&2.0f32.to_le_bytes());
    let instance = env.push_struct_owned(&vec2, &source).unwrap();

    // Mutate the original bytes; the script copy must not change.
    source[0..4].copy_from_slice(&9.0f32.to_le_bytes());
    let x = env.get_member(instance, "x").unwrap();
    assert_eq!(x.as_float(), Some(1.0));
}

#[test]
fn test_unregistered_struct_type_is_rejected() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let vec2 = vector_struct();
    let bytes = vec2.default_bytes();
    let err = env.push_struct_owned(&vec2, &bytes);
    assert!(matches!(err, Err(BridgeError::UnknownStructType(_))));
}

#[test]
fn test_struct_registration_is_idempotent() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let vec2 = vector_struct();
    env.register_struct_type(&vec2);
    env.register_struct_type(&vec2);
    let bytes = vec2.default_bytes();
    assert!(env.push_struct_owned(&vec2, &bytes).is_ok());
}

static DROPPED: AtomicUsize = AtomicUsize::new(0);

fn counting_drop(_bytes: &mut [u8]) {
    DROPPED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_owned_struct_drop_hook_runs_exactly_once() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let tracked = StructBuilder::new("Tracked")
        .field("v", TypeKind::Int32)
        .drop_hook(counting_drop)
        .build();
    env.register_struct_type(&tracked);

    DROPPED.store(0, Ordering::SeqCst);
    let bytes = tracked.default_bytes();
    let _unreferenced = env.push_struct_owned(&tracked, &bytes).unwrap();
    env.collect_garbage().unwrap();
    assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    env.collect_garbage().unwrap();
    assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_borrowed_struct_writes_through_to_host_bytes() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let vec2 = vector_struct();
    env.register_struct_type(&vec2);

    let mut storage = [0u8; 8];
    storage[0..4].copy_from_slice(&1.0f32.to_le_bytes());
    storage[4..8].copy_from_slice(&2.0f32.to_le_bytes());
    let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
    let instance = unsafe { env.push_struct_borrowed(&vec2, ptr, storage.len()) }.unwrap();

    let x = env.get_member(instance, "x").unwrap();
    assert_eq!(x.as_float(), Some(1.0));

    let five = env.make_value(&HostValue::Float64(5.0)).unwrap();
    env.set_member(instance, "y", five).unwrap();
    // Borrowed: no copy, so the write is visible in the host storage.
    let y = f32::from_le_bytes([storage[4], storage[5], storage[6], storage[7]]);
    assert_eq!(y, 5.0);
}

#[test]
fn test_memory_accounting_rises_and_falls() {
    let host = HostRegistry::shared();
    let mut env = Environment::new(host).unwrap();
    let baseline = env.memory_used();
    for i in 0..32 {
        env.make_value(&HostValue::Text(format!("transient-{i}")))
            .unwrap();
    }
    assert!(env.memory_used() > baseline);
    env.collect_garbage().unwrap();
    assert_eq!(env.memory_used(), baseline);
}

#[test]
fn test_allocation_failure_poisons_environment() {
    let host = HostRegistry::shared();
    let mut env = Environment::with_account(host, MemoryAccount::with_limit(2048)).unwrap();
    let mut failed = false;
    for i in 0..256 {
        let value = HostValue::Text(format!("padding-padding-padding-{i}"));
        match env.make_value(&value) {
            Ok(v) => {
                // Pin each string so collection cannot save the day.
                let _ = env.create_reverse_reference(v, RefKind::Value, "oom-test");
            }
            Err(e) => {
                assert!(e.is_fatal(), "expected fatal allocation failure, got {e}");
                failed = true;
                break;
            }
        }
    }
    assert!(failed);
    assert!(!env.is_usable());
    let err = env.make_value(&HostValue::Bool(true));
    assert!(matches!(err, Err(BridgeError::Fatal(_))));
}

#[test]
fn test_environments_are_isolated() {
    let host_a = HostRegistry::shared();
    let host_b = HostRegistry::shared();
    let mut env_a = Environment::new(host_a.clone()).unwrap();
    let mut env_b = Environment::new(host_b.clone()).unwrap();
    let class = point_class();
    let ha = host_a.borrow_mut().create(&class);
    let hb = host_b.borrow_mut().create(&class);
    let pa = env_a.obtain_proxy(ha).unwrap();
    let pb = env_b.obtain_proxy(hb).unwrap();
    assert_eq!(env_a.resolve_host_handle(pa).unwrap(), ha);
    assert_eq!(env_b.resolve_host_handle(pb).unwrap(), hb);
    drop(env_a);
    // Dropping one environment leaves the other fully functional.
    assert_eq!(env_b.resolve_host_handle(pb).unwrap(), hb);
}
