//! Coarse byte-footprint estimates for cached values.

use std::collections::HashMap;
use std::sync::Arc;

/// Fixed bookkeeping cost charged to every entry on top of key and value
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Approximate heap + inline size of a value, used for the store budget.
///
/// The numbers only need to be stable and roughly proportional; exact
/// allocator accounting is not attempted.
pub trait EstimateSize {
    fn approx_size(&self) -> usize;
}

/// Footprint charged against the store budget for one entry
pub fn entry_size<V: EstimateSize + ?Sized>(key: &str, value: &V) -> usize {
    key.len() + value.approx_size() + ENTRY_OVERHEAD_BYTES
}

impl EstimateSize for String {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for str {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for &'static str {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn approx_size(&self) -> usize {
        self.iter().map(EstimateSize::approx_size).sum()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn approx_size(&self) -> usize {
        self.as_ref().map_or(0, EstimateSize::approx_size)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn approx_size(&self) -> usize {
        (**self).approx_size()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn approx_size(&self) -> usize {
        (**self).approx_size()
    }
}

impl<V: EstimateSize> EstimateSize for HashMap<String, V> {
    fn approx_size(&self) -> usize {
        self.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
    }
}

macro_rules! fixed_size {
    ($($t:ty),*) => {
        $(
            impl EstimateSize for $t {
                fn approx_size(&self) -> usize {
                    std::mem::size_of::<$t>()
                }
            }
        )*
    };
}

fixed_size!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);

impl EstimateSize for serde_json::Value {
    fn approx_size(&self) -> usize {
        use serde_json::Value;
        match self {
            Value::Null => 4,
            Value::Bool(_) => 1,
            Value::Number(_) => 8,
            Value::String(s) => s.len(),
            Value::Array(items) => items.iter().map(EstimateSize::approx_size).sum::<usize>() + items.len(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.approx_size())
                .sum::<usize>()
                + map.len() * 2,
        }
    }
}
