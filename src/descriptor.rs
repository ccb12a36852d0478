//! Per-expression and per-node option bags.
//!
//! A descriptor is a set of enumerated hints; some carry a value encoded as
//! a string and re-parsed by the typed accessor. A node's effective
//! descriptor is its own over its parent expression's over the library
//! defaults; the merge is first-set-wins per option.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Recognised descriptor options.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Param {
    /// Interpret the mask as its complement. Only valid with a mask.
    MaskComplement,
    /// Combine output with the existing destination instead of overwriting.
    AccumResult,
    /// Skip the pre-sort step on bulk data ingress.
    ValuesSorted,
    /// Skip the duplicate-reduction step on bulk data ingress.
    NoDuplicates,
    /// Emit per-task timing into the library log.
    ProfileTime,
    /// Pin the node to a specific device (value: device id).
    DeviceId,
    /// Position-modulo device assignment instead of round-robin.
    DeviceFixedStrategy,
    /// Threshold for the sparse→dense transition inside algorithms.
    DenseFactor,
    /// Stop a reduction/product as soon as the result stabilises.
    EarlyExit,
    /// Clear destination entries outside the mask when masking applies.
    Replace,
}

/// A bag of option flags, optionally valued.
#[derive(Clone, Debug, Default)]
pub struct Descriptor {
    params: HashMap<Param, String>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a flag option (no value).
    pub fn set_param(&mut self, param: Param) -> &mut Self {
        self.params.insert(param, String::new());
        self
    }

    /// Set a valued option; the value is stored in its string form.
    pub fn set_param_value(&mut self, param: Param, value: impl ToString) -> &mut Self {
        self.params.insert(param, value.to_string());
        self
    }

    /// Whether the option is present.
    pub fn is_param_set(&self, param: Param) -> bool {
        self.params.contains_key(&param)
    }

    /// Parse the option's value as `T`.
    ///
    /// Returns `Ok(None)` when the option is absent and `InvalidArgument`
    /// when present but unparsable.
    pub fn get_param_t<T: FromStr>(&self, param: Param) -> Result<Option<T>> {
        match self.params.get(&param) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                Error::invalid_argument(format!("descriptor option {param:?} holds unparsable value `{raw}`"))
            }),
        }
    }

    /// Overlay: options set in `self` win, the rest come from `base`.
    pub fn merged_over(&self, base: &Descriptor) -> Descriptor {
        let mut params = base.params.clone();
        for (k, v) in &self.params {
            params.insert(*k, v.clone());
        }
        Descriptor { params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_values() {
        let mut d = Descriptor::new();
        d.set_param(Param::AccumResult);
        d.set_param_value(Param::DeviceId, 3usize);
        d.set_param_value(Param::DenseFactor, 0.5f64);

        assert!(d.is_param_set(Param::AccumResult));
        assert!(!d.is_param_set(Param::Replace));
        assert_eq!(d.get_param_t::<usize>(Param::DeviceId).unwrap(), Some(3));
        assert_eq!(d.get_param_t::<f64>(Param::DenseFactor).unwrap(), Some(0.5));
        assert_eq!(d.get_param_t::<usize>(Param::MaskComplement).unwrap(), None);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let mut d = Descriptor::new();
        d.set_param_value(Param::DeviceId, "not-a-number");
        assert!(d.get_param_t::<usize>(Param::DeviceId).is_err());
    }

    #[test]
    fn merge_prefers_overlay() {
        let mut expr = Descriptor::new();
        expr.set_param_value(Param::DeviceId, 1usize);
        expr.set_param(Param::ProfileTime);

        let mut node = Descriptor::new();
        node.set_param_value(Param::DeviceId, 2usize);

        let eff = node.merged_over(&expr);
        assert_eq!(eff.get_param_t::<usize>(Param::DeviceId).unwrap(), Some(2));
        assert!(eff.is_param_set(Param::ProfileTime));
    }
}
