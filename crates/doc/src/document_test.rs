use crate::{array, doc, Doc, Value};

#[test]
fn preserves_insertion_order() {
    let d = doc! { "b" => 1, "a" => 2, "c" => 3 };
    let names: Vec<&str> = d.iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["b", "a", "c"]);
}

#[test]
fn duplicate_names_keep_first_on_get() {
    let mut d = Doc::new();
    d.push("k", 1);
    d.push("k", 2);
    assert_eq!(d.get_i64("k"), Some(1));
    assert_eq!(d.len(), 2);
}

#[test]
fn front_returns_command_verb() {
    let d = doc! { "insert" => "users", "documents" => array![doc! { "x" => 1 }] };
    let (name, value) = d.front().unwrap();
    assert_eq!(name, "insert");
    assert_eq!(value.as_str(), Some("users"));
}

#[test]
fn typed_accessors() {
    let d = doc! {
        "s" => "text",
        "i" => 42i64,
        "f" => 1.5,
        "b" => true,
        "d" => doc! { "inner" => 1 },
        "a" => array![1, 2, 3],
    };
    assert_eq!(d.get_str("s"), Some("text"));
    assert_eq!(d.get_i64("i"), Some(42));
    assert_eq!(d.get_f64("f"), Some(1.5));
    assert_eq!(d.get_bool("b"), Some(true));
    assert_eq!(d.get_doc("d").unwrap().get_i64("inner"), Some(1));
    assert_eq!(d.get_array("a").unwrap().len(), 3);
    assert_eq!(d.get_str("missing"), None);
    assert_eq!(d.get_i64("s"), None);
}

#[test]
fn ok_flag() {
    assert!(doc! { "ok" => 1 }.is_ok());
    assert!(doc! { "ok" => 1.0 }.is_ok());
    assert!(!doc! { "ok" => 0 }.is_ok());
    assert!(!Doc::new().is_ok());
}

#[test]
fn display_is_readable() {
    let d = doc! { "a" => 1, "b" => Value::Null };
    assert_eq!(d.to_string(), "{ a: 1, b: null }");
}
