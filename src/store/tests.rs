//! Unit tests for the shared store.

use super::*;
use rstest::rstest;

#[rstest]
fn insert_then_get_returns_value() {
    let mut store = Store::new();
    assert!(!store.insert("router.existing", vec![String::from("r1")]));

    let value = store
        .get::<Vec<String>>("router.existing")
        .expect("value should be present");
    assert_eq!(value, &vec![String::from("r1")]);
}

#[rstest]
fn insert_reports_replacement() {
    let mut store = Store::new();
    store.insert("k", 1_u32);
    assert!(store.insert("k", 2_u32));
    assert_eq!(store.get::<u32>("k"), Ok(&2));
}

#[rstest]
fn get_missing_key_is_an_error() {
    let store = Store::new();
    let err = store.get::<u32>("absent").expect_err("missing key");
    assert_eq!(
        err,
        StoreError::Missing {
            key: String::from("absent")
        }
    );
}

#[rstest]
fn get_with_wrong_type_is_an_error() {
    let mut store = Store::new();
    store.insert("k", String::from("text"));
    let err = store.get::<u32>("k").expect_err("type mismatch");
    assert!(
        matches!(err, StoreError::TypeMismatch { ref key, .. } if key == "k"),
        "unexpected error: {err}"
    );
}

#[rstest]
fn get_mut_allows_appending() {
    let mut store = Store::new();
    store.insert("network.existing", vec![1_u8]);
    store
        .get_mut::<Vec<u8>>("network.existing")
        .expect("present")
        .push(2);
    assert_eq!(store.get::<Vec<u8>>("network.existing"), Ok(&vec![1, 2]));
}

#[rstest]
fn remove_with_wrong_type_keeps_value() {
    let mut store = Store::new();
    store.insert("k", 7_i64);
    assert!(store.remove::<String>("k").is_err());
    assert_eq!(store.remove::<i64>("k"), Ok(7));
    assert!(store.is_empty());
}

#[rstest]
fn keys_are_sorted_and_namespaced() {
    let mut store = Store::new();
    store.insert(key("subnet", "existing"), ());
    store.insert(key("network", "existing"), ());
    assert_eq!(store.keys(), vec!["network.existing", "subnet.existing"]);
    assert_eq!(store.len(), 2);
    assert!(store.contains("subnet.existing"));
}
