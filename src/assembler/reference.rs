//! Undefined references: deferred contributions to a generated word.
use crate::word36::FieldDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The reserved labels which evaluate to a bank descriptor index at link time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum SpecialKind {
    Bdi,
    BdiCall,
    BdiRef,
    Lbdi,
    LbdiCall,
    LbdiRef,
}

impl SpecialKind {
    pub fn from_label(label: &str) -> Option<SpecialKind> {
        match label.to_uppercase().as_str() {
            "BDI$" => Some(SpecialKind::Bdi),
            "BDICALL$" => Some(SpecialKind::BdiCall),
            "BDIREF$" => Some(SpecialKind::BdiRef),
            "LBDI$" => Some(SpecialKind::Lbdi),
            "LBDICALL$" => Some(SpecialKind::LbdiCall),
            "LBDIREF$" => Some(SpecialKind::LbdiRef),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpecialKind::Bdi => "BDI$",
            SpecialKind::BdiCall => "BDICALL$",
            SpecialKind::BdiRef => "BDIREF$",
            SpecialKind::Lbdi => "LBDI$",
            SpecialKind::LbdiCall => "LBDICALL$",
            SpecialKind::LbdiRef => "LBDIREF$",
        }
    }

    /// True for the kinds which name a target.
    pub fn takes_target(&self) -> bool {
        !matches!(self, SpecialKind::Bdi | SpecialKind::Lbdi)
    }

    /// True for the kinds which yield zero when the target lives in the
    /// same bank as the reference.
    pub fn is_call(&self) -> bool {
        matches!(self, SpecialKind::BdiCall | SpecialKind::LbdiCall)
    }

    /// True for the kinds which include the bank level.
    pub fn includes_level(&self) -> bool {
        matches!(self, SpecialKind::Lbdi | SpecialKind::LbdiCall | SpecialKind::LbdiRef)
    }
}

/// What a special reference points at.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum SpecialTarget {
    Label(String),
    LocationCounter(u32),
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum UndefinedReference {
    ToLabel {
        label: String,
        is_negative: bool,
        field: FieldDescriptor,
    },
    ToLocationCounter {
        lc_index: u32,
        is_negative: bool,
        field: FieldDescriptor,
    },
    Special {
        kind: SpecialKind,
        target: Option<SpecialTarget>,
        field: FieldDescriptor,
    },
}

impl UndefinedReference {
    pub fn to_label(label: &str) -> Self {
        UndefinedReference::ToLabel {
            label: label.to_uppercase(),
            is_negative: false,
            field: FieldDescriptor::W,
        }
    }

    pub fn to_location_counter(lc_index: u32) -> Self {
        UndefinedReference::ToLocationCounter {
            lc_index,
            is_negative: false,
            field: FieldDescriptor::W,
        }
    }

    pub fn field(&self) -> FieldDescriptor {
        match self {
            UndefinedReference::ToLabel { field, .. } => *field,
            UndefinedReference::ToLocationCounter { field, .. } => *field,
            UndefinedReference::Special { field, .. } => *field,
        }
    }

    pub fn is_negative(&self) -> bool {
        match self {
            UndefinedReference::ToLabel { is_negative, .. } => *is_negative,
            UndefinedReference::ToLocationCounter { is_negative, .. } => *is_negative,
            UndefinedReference::Special { .. } => false,
        }
    }

    /// A copy re-anchored to another field.
    pub fn with_field(&self, new_field: FieldDescriptor) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            UndefinedReference::ToLabel { field, .. } => *field = new_field,
            UndefinedReference::ToLocationCounter { field, .. } => *field = new_field,
            UndefinedReference::Special { field, .. } => *field = new_field,
        }
        copy
    }

    /// A copy with the sign flipped. Special references have no sign.
    pub fn negated(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            UndefinedReference::ToLabel { is_negative, .. } => *is_negative = !*is_negative,
            UndefinedReference::ToLocationCounter { is_negative, .. } => *is_negative = !*is_negative,
            UndefinedReference::Special { .. } => {}
        }
        copy
    }

    // Same target and field, ignoring sign.
    fn cancels(&self, other: &UndefinedReference) -> bool {
        match (self, other) {
            (
                UndefinedReference::ToLabel { label: l1, is_negative: n1, field: f1 },
                UndefinedReference::ToLabel { label: l2, is_negative: n2, field: f2 },
            ) => l1 == l2 && f1 == f2 && n1 != n2,
            (
                UndefinedReference::ToLocationCounter { lc_index: i1, is_negative: n1, field: f1 },
                UndefinedReference::ToLocationCounter { lc_index: i2, is_negative: n2, field: f2 },
            ) => i1 == i2 && f1 == f2 && n1 != n2,
            _ => false,
        }
    }
}

/// Removes pairs of references which cancel each other out, such as
/// `+FOO` and `-FOO` in the same field.
pub fn coalesce(references: Vec<UndefinedReference>) -> Vec<UndefinedReference> {
    let mut result: Vec<UndefinedReference> = Vec::with_capacity(references.len());
    for reference in references {
        match result.iter().position(|r| r.cancels(&reference)) {
            Some(px) => {
                result.remove(px);
            }
            None => result.push(reference),
        }
    }
    result
}

impl fmt::Display for UndefinedReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UndefinedReference::ToLabel { label, is_negative, field } => {
                write!(f, "{}{}{}", if *is_negative { "-" } else { "+" }, label, field)
            }
            UndefinedReference::ToLocationCounter { lc_index, is_negative, field } => {
                write!(f, "{}$({}){}", if *is_negative { "-" } else { "+" }, lc_index, field)
            }
            UndefinedReference::Special { kind, target, field } => match target {
                Some(SpecialTarget::Label(label)) => write!(f, "+{}({}){}", kind.label(), label, field),
                Some(SpecialTarget::LocationCounter(lc)) => write!(f, "+{}($({})){}", kind.label(), lc, field),
                None => write!(f, "+{}{}", kind.label(), field),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_cancels_opposites() {
        let plus = UndefinedReference::to_label("foo");
        let minus = plus.negated();
        let other = UndefinedReference::to_location_counter(2);
        let result = coalesce(vec![plus.clone(), other.clone(), minus]);
        assert_eq!(result, vec![other]);

        let result = coalesce(vec![plus.clone(), plus.clone()]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_with_field() {
        let fd = FieldDescriptor::new(18, 18);
        let reference = UndefinedReference::to_label("BAR").with_field(fd);
        assert_eq!(reference.field(), fd);
        assert_eq!(reference.to_string(), "+BAR[18:18]");
    }

    #[test]
    fn test_special_kinds() {
        assert_eq!(SpecialKind::from_label("lbdicall$"), Some(SpecialKind::LbdiCall));
        assert_eq!(SpecialKind::from_label("FOO$"), None);
        assert!(!SpecialKind::Bdi.takes_target());
        assert!(SpecialKind::BdiRef.takes_target());
        assert!(SpecialKind::LbdiCall.is_call() && SpecialKind::LbdiCall.includes_level());
    }
}
