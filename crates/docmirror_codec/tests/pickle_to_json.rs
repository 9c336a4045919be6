//! End-to-end conversion of pickled records to JSON.

use docmirror_codec::{
    pickle_to_json, pickle_to_json_with, JsonOptions, RecordTransform, ReducerRegistry, SkipReason,
    Transformed,
};
use docmirror_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn compact(data: &[u8]) -> String {
    pickle_to_json(data, JsonOptions::compact()).unwrap()
}

#[test]
fn flat_dict_at_every_protocol() {
    let value = PyValue::Dict(vec![
        ("a".into(), PyValue::Int(1)),
        (
            "b".into(),
            PyValue::List(vec![PyValue::Int(1), PyValue::Int(2), PyValue::Int(3)]),
        ),
    ]);
    for protocol in 0..=4 {
        assert_eq!(compact(&value.to_pickle(protocol)), r#"{"a":1,"b":[1,2,3]}"#, "protocol {protocol}");
    }
}

#[test]
fn self_containing_list() {
    // l = [1, 2]; l.append((3, l))
    let mut w = PickleWriter::new(2);
    w.empty_list().put(0);
    w.mark().int(1).int(2).int(3).get(0).tuple_n(2).put(1).appends();
    assert_eq!(
        compact(&w.finish()),
        r#"{"::":"shared","::id":0,"value":[1,2,[3,{"::":"ref","id":0}]]}"#
    );
}

#[test]
fn shared_but_acyclic_values_are_inlined() {
    // x = [1]; [x, x]
    let mut w = PickleWriter::new(2);
    w.empty_list().put(0);
    w.mark().empty_list().put(1).int(1).append().get(1).appends();
    assert_eq!(compact(&w.finish()), "[[1],[1]]");
}

#[test]
fn self_referencing_object() {
    // n = Node(); n.me = n
    let mut w = PickleWriter::new(2);
    w.global("__main__", "Node").put(0);
    w.empty_tuple().newobj().put(1);
    w.empty_dict().put(2).str("me").get(1).setitem().build();
    assert_eq!(
        compact(&w.finish()),
        r#"{"me":{"::":"ref","id":1},"::":"__main__.Node","::id":1}"#
    );
}

#[test]
fn sets_become_sorted_lists() {
    let mut w = PickleWriter::new(4);
    w.empty_set().mark().int(3).int(1).int(2).additems();
    assert_eq!(compact(&w.finish()), "[1,2,3]");

    let mut w = PickleWriter::new(2);
    w.global("__builtin__", "set");
    w.empty_list().mark().str("b").str("a").appends().tuple_n(1).reduce();
    assert_eq!(compact(&w.finish()), r#"["a","b"]"#);
}

#[test]
fn decimals_become_floats() {
    let mut w = PickleWriter::new(2);
    w.global("decimal", "Decimal").str("1.25").tuple_n(1).reduce();
    assert_eq!(compact(&w.finish()), "1.25");
}

#[test]
fn datetimes_with_and_without_tz() {
    let payload = [0x07, 0xd1, 2, 3, 4, 5, 6, 0, 0, 0];

    let mut w = PickleWriter::new(3);
    w.global("datetime", "datetime").bytes(&payload).tuple_n(1).reduce();
    assert_eq!(compact(&w.finish()), r#""2001-02-03T04:05:06""#);

    let mut w = PickleWriter::new(3);
    w.global("datetime", "datetime").put(0).bytes(&payload);
    w.global("pytz", "_UTC").put(1).empty_tuple().reduce().put(2);
    w.tuple_n(2).put(3).reduce().put(4);
    assert_eq!(
        compact(&w.finish()),
        r#"{"value":"2001-02-03T04:05:06","tz":{"::":"pytz._UTC"},"::":"datetime"}"#
    );
}

#[test]
fn persistent_references() {
    let mut w = PickleWriter::new(3);
    w.empty_dict().mark();
    w.str("plain").persistent(5);
    w.str("hinted").persistent_with_class(6, "app", "Child");
    w.setitems();
    assert_eq!(
        compact(&w.finish()),
        r#"{"plain":{"::":"persistent","id":5},"hinted":{"::":"persistent","id":[6,"app.Child"]}}"#
    );
}

#[test]
fn reconstructor_uses_class_state() {
    let mut w = PickleWriter::new(2);
    w.global("copy_reg", "_reconstructor");
    w.global("app", "Legacy").global("__builtin__", "object").none().tuple_n(3).reduce();
    w.empty_dict().str("x").int(1).setitem().build();
    assert_eq!(compact(&w.finish()), r#"{"x":1,"::":"app.Legacy"}"#);
}

#[test]
fn user_reducers_build_custom_nodes() {
    let registry = ReducerRegistry::new().with_reducer("app.Point", |r| {
        let items = r.arg_items()?;
        let arena = r.arena();
        let x = arena.string("x");
        let y = arena.string("y");
        Ok(Some(arena.mapping(vec![(x, items[0]), (y, items[1])])))
    });
    let mut w = PickleWriter::new(2);
    w.global("app", "Point").int(1).int(2).tuple_n(2).reduce();
    let json = pickle_to_json_with(&w.finish(), &registry, JsonOptions::compact()).unwrap();
    assert_eq!(json, r#"{"x":1,"y":2}"#);
}

#[test]
fn declining_reducer_falls_back_to_class_record() {
    let registry = ReducerRegistry::new().with_reducer("app.Maybe", |_| Ok(None));
    let mut w = PickleWriter::new(2);
    w.global("app", "Maybe").int(7).tuple_n(1).reduce();
    let json = pickle_to_json_with(&w.finish(), &registry, JsonOptions::compact()).unwrap();
    assert_eq!(json, r#"{"::":"app.Maybe","::()":[7]}"#);
}

#[test]
fn pretty_output_is_sorted_and_indented() {
    let value = PyValue::Dict(vec![("b".into(), PyValue::Int(1)), ("a".into(), PyValue::None)]);
    let json = pickle_to_json(&value.to_pickle(3), JsonOptions::pretty()).unwrap();
    assert_eq!(json, "{\n  \"a\": null,\n  \"b\": 1\n}");
}

#[test]
fn record_transform_end_to_end() {
    let raw = dict_record("app.models", "Doc", &[("n", 3)]);
    let out = RecordTransform::new().transform(42, &raw).into_record().unwrap();
    assert_eq!(out.class_name, "app.models.Doc");
    assert_eq!(out.state_json, r#"{"n":3}"#);
    assert!(raw.starts_with(&out.header_bytes));
    assert!(out.header_bytes.len() < raw.len());
}

#[test]
fn record_state_can_reference_the_class_pickle_memo() {
    // The state pickle reuses the class reference memoized by the class pickle.
    let raw = record(3, "app", "Doc", |w| {
        w.empty_dict().put(2).str("kind").get(0).setitem();
    });
    let out = RecordTransform::new().transform(1, &raw).into_record().unwrap();
    assert_eq!(out.state_json, r#"{"kind":{"::":"global","name":"app.Doc"}}"#);
}

#[test]
fn self_containing_state_dict() {
    let raw = record(3, "app", "Doc", |w| {
        w.empty_dict().put(2).str("self").get(2).setitem();
    });
    let out = RecordTransform::new().transform(1, &raw).into_record().unwrap();
    assert_eq!(out.state_json, r#"{"self":{"::":"ref","id":2},"::id":2}"#);
}

#[test]
fn skips_and_hooks() {
    let transform = RecordTransform::new();
    assert_eq!(
        transform.transform(1, &btree_record()),
        Transformed::Skip(SkipReason::Filtered {
            class_name: "BTrees.OOBTree.OOBucket".into()
        })
    );

    let hooked = RecordTransform::new().with_hook(|class_name, state| match class_name {
        "app.Secret" => Some(String::new()),
        "app.Doc" => Some(state.replace("\"n\"", "\"count\"")),
        _ => None,
    });
    let doc = hooked
        .transform(2, &dict_record("app", "Doc", &[("n", 1)]))
        .into_record()
        .unwrap();
    assert_eq!(doc.state_json, r#"{"count":1}"#);
    assert!(matches!(
        hooked.transform(3, &dict_record("app", "Secret", &[])),
        Transformed::Skip(SkipReason::Declined { .. })
    ));
    let other = hooked
        .transform(4, &dict_record("app", "Other", &[("n", 2)]))
        .into_record()
        .unwrap();
    assert_eq!(other.state_json, r#"{"n":2}"#);
}

#[test]
fn nul_characters_are_scrubbed_from_state() {
    let raw = record(3, "app", "Doc", |w| {
        w.empty_dict().str("t").str("a\0b").setitem();
    });
    let out = RecordTransform::new().transform(1, &raw).into_record().unwrap();
    assert_eq!(out.state_json, r#"{"t":"a b"}"#);
}

#[test]
fn memo_errors_are_reported() {
    let mut w = PickleWriter::new(2);
    w.empty_list().put(0).put(0);
    assert!(pickle_to_json(&w.finish(), JsonOptions::compact()).is_err());

    let mut w = PickleWriter::new(2);
    w.get(9);
    assert!(pickle_to_json(&w.finish(), JsonOptions::compact()).is_err());
}

#[test]
fn class_reference_nodes_are_tagged() {
    let mut w = PickleWriter::new(3);
    w.global("app", "Doc");
    let json = compact(&w.finish());
    assert_eq!(json, r#"{"::":"global","name":"app.Doc"}"#);
}

fn expected(value: &PyValue) -> Value {
    match value {
        PyValue::None => Value::Null,
        PyValue::Bool(b) => Value::Bool(*b),
        PyValue::Int(i) => json!(i),
        PyValue::Float(f) => json!(f),
        PyValue::Str(s) => Value::from(s.as_str()),
        PyValue::List(items) | PyValue::Tuple(items) => Value::Array(items.iter().map(expected).collect()),
        PyValue::Dict(pairs) => {
            let mut map = Map::new();
            for (key, value) in pairs {
                map.insert(key.clone(), expected(value));
            }
            Value::Object(map)
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn output_is_independent_of_protocol(value in py_value_strategy()) {
        let want = expected(&value);
        for protocol in 0..=4 {
            let json = pickle_to_json(&value.to_pickle(protocol), JsonOptions::compact()).unwrap();
            let got: Value = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(&got, &want, "protocol {}", protocol);
        }
    }

    #[test]
    fn conversion_is_deterministic(value in py_value_strategy(), protocol in protocol_strategy()) {
        let data = value.to_pickle(protocol);
        let first = pickle_to_json(&data, JsonOptions::pretty()).unwrap();
        let second = pickle_to_json(&data, JsonOptions::pretty()).unwrap();
        prop_assert_eq!(first, second);
    }
}
