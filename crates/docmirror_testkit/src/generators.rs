//! Property-based test generators using proptest.

use crate::pickle::PickleWriter;
use proptest::prelude::*;

/// A plain Python value that can be pickled at any protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum PyValue {
    /// `None`.
    None,
    /// `bool`.
    Bool(bool),
    /// `int`.
    Int(i64),
    /// `float`.
    Float(f64),
    /// `str`.
    Str(String),
    /// `list`.
    List(Vec<PyValue>),
    /// `tuple`.
    Tuple(Vec<PyValue>),
    /// `dict` with string keys.
    Dict(Vec<(String, PyValue)>),
}

impl PyValue {
    /// Writes the value, without a trailing `STOP`.
    pub fn write(&self, w: &mut PickleWriter) {
        match self {
            Self::None => {
                w.none();
            }
            Self::Bool(b) => {
                w.bool(*b);
            }
            Self::Int(i) => {
                w.int(*i);
            }
            Self::Float(f) => {
                w.float(*f);
            }
            Self::Str(s) => {
                w.str(s);
            }
            Self::List(items) => {
                w.empty_list();
                if !items.is_empty() {
                    w.mark();
                    for item in items {
                        item.write(w);
                    }
                    w.appends();
                }
            }
            Self::Tuple(items) => {
                if items.len() > 3 || w.protocol() < 2 {
                    w.mark();
                }
                for item in items {
                    item.write(w);
                }
                if items.len() > 3 || w.protocol() < 2 {
                    w.tuple();
                } else {
                    w.tuple_n(items.len());
                }
            }
            Self::Dict(pairs) => {
                w.empty_dict();
                for (key, value) in pairs {
                    w.str(key);
                    value.write(w);
                    w.setitem();
                }
            }
        }
    }

    /// Pickles the value at `protocol`.
    pub fn to_pickle(&self, protocol: u8) -> Vec<u8> {
        let mut w = PickleWriter::new(protocol);
        self.write(&mut w);
        w.finish()
    }
}

/// Strategy for pickle protocols the decoder accepts.
pub fn protocol_strategy() -> impl Strategy<Value = u8> {
    0u8..=4
}

/// Strategy for dictionary keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z_][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for scalar values.
pub fn scalar_strategy() -> impl Strategy<Value = PyValue> {
    prop_oneof![
        Just(PyValue::None),
        any::<bool>().prop_map(PyValue::Bool),
        any::<i64>().prop_map(PyValue::Int),
        (-1.0e12f64..1.0e12).prop_map(PyValue::Float),
        prop::string::string_regex("[ -~\u{e9}\u{4e2d}]{0,16}")
            .expect("Invalid regex")
            .prop_map(PyValue::Str),
    ]
}

/// Strategy for nested values up to a few levels deep.
pub fn py_value_strategy() -> impl Strategy<Value = PyValue> {
    scalar_strategy().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(PyValue::List),
            prop::collection::vec(inner.clone(), 0..5).prop_map(PyValue::Tuple),
            prop::collection::vec((key_strategy(), inner), 0..6).prop_map(PyValue::Dict),
        ]
    })
}

/// Strategy for transaction sizes: a sequence of per-tid record counts.
pub fn transaction_sizes_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..12, 1..30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuples_use_short_opcodes_at_protocol_2() {
        let value = PyValue::Tuple(vec![PyValue::Int(1), PyValue::Int(2)]);
        assert_eq!(value.to_pickle(2), b"\x80\x02K\x01K\x02\x86.".to_vec());
        assert_eq!(value.to_pickle(1), b"(K\x01K\x02t.".to_vec());
    }
}
