use crate::{doc, hashed_key, Value};

#[test]
fn stable_within_a_process_and_across_calls() {
    let v = Value::Int64(42);
    assert_eq!(hashed_key(&v), hashed_key(&v));
}

#[test]
fn numeric_representations_collapse() {
    assert_eq!(
        hashed_key(&Value::Int32(42)),
        hashed_key(&Value::Int64(42))
    );
    assert_eq!(
        hashed_key(&Value::Int64(42)),
        hashed_key(&Value::Double(42.0))
    );
    // Fractions truncate onto the integer path
    assert_eq!(
        hashed_key(&Value::Double(42.9)),
        hashed_key(&Value::Int64(42))
    );
}

#[test]
fn nan_hashes_as_zero() {
    assert_eq!(
        hashed_key(&Value::Double(f64::NAN)),
        hashed_key(&Value::Int64(0))
    );
}

#[test]
fn out_of_range_doubles_saturate() {
    assert_eq!(
        hashed_key(&Value::Double(1e300)),
        hashed_key(&Value::Int64(i64::MAX))
    );
    assert_eq!(
        hashed_key(&Value::Double(-1e300)),
        hashed_key(&Value::Int64(i64::MIN))
    );
}

#[test]
fn type_distinguishes_equal_payloads() {
    // Same byte content, different type code
    assert_ne!(
        hashed_key(&Value::String("42".into())),
        hashed_key(&Value::Int64(42))
    );
    assert_ne!(hashed_key(&Value::Null), hashed_key(&Value::MinKey));
}

#[test]
fn nested_docs_hash_names_and_values() {
    let a = doc! { "x" => 1 };
    let b = doc! { "y" => 1 };
    assert_ne!(
        hashed_key(&Value::Doc(a)),
        hashed_key(&Value::Doc(b))
    );
}

#[test]
fn distinct_values_spread() {
    let hashes: Vec<i64> = (0..100)
        .map(|i| hashed_key(&Value::Int64(i)))
        .collect();
    let mut unique = hashes.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), hashes.len());
}
