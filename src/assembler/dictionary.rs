//! The symbol table: a chain of label scopes.
//!
//! Level 0 is the innermost (current) scope and each higher level is an
//! enclosing one. The system dictionary sits beyond the outermost level; it
//! can be searched but never written through `add_value`.
use super::directives;
use super::functions;
use super::value::{Form, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub type Scope = BTreeMap<String, Value>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NotFound;

const LABEL_PATTERN: &str = r"^[a-zA-Z_$][a-zA-Z0-9_$]{0,11}$";

/// True for 1 to 12 characters of `[A-Za-z_$][A-Za-z0-9_$]*`.
pub fn is_valid_label(label: &str) -> bool {
    static LABEL: OnceLock<Option<Regex>> = OnceLock::new();
    compile_once(&LABEL, LABEL_PATTERN).map_or(false, |re| re.is_match(label))
}

/// Compiles `pattern` the first time it is asked for. A pattern that does
/// not compile is logged once and matches nothing afterwards.
pub(crate) fn compile_once(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!("bad pattern {}: {}", pattern, e);
            None
        }
    })
    .as_ref()
}

/// User labels follow the general rule but may not begin with `$`, which is
/// reserved for the system dictionary.
pub fn is_valid_user_label(label: &str) -> bool {
    is_valid_label(label) && !label.starts_with('$')
}

#[derive(Clone, Debug)]
pub struct Dictionary {
    system: Scope,
    // Outermost first; the last entry is level 0.
    scopes: Vec<Scope>,
}

impl Dictionary {
    /// A dictionary with a single scope above the system dictionary.
    pub fn new(system: Scope) -> Self {
        Dictionary { system, scopes: vec![Scope::new()] }
    }

    /// Opens a new innermost scope. What was level 0 becomes level 1.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Discards the innermost scope. The outermost scope is never removed.
    pub fn pop_scope(&mut self) -> Option<Scope> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    /// Number of writable levels.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    // Levels beyond the outermost writable scope land in the outermost one.
    fn index_for_level(&self, level: usize) -> usize {
        let top = self.scopes.len() - 1;
        top - level.min(top)
    }

    /// Binds `label` at `level` scopes out from the current one, replacing and
    /// returning any previous binding at that level.
    pub fn add_value(&mut self, level: usize, label: &str, value: Value) -> Option<Value> {
        let index = self.index_for_level(level);
        self.scopes[index].insert(label.to_uppercase(), value)
    }

    pub fn has_value_at(&self, level: usize, label: &str) -> bool {
        let index = self.index_for_level(level);
        self.scopes[index].contains_key(&label.to_uppercase())
    }

    /// Searches from level 0 outward, then the system dictionary.
    pub fn get_value(&self, label: &str) -> Result<&Value, NotFound> {
        let key = label.to_uppercase();
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(&key) {
                return Ok(value);
            }
        }
        self.system.get(&key).ok_or(NotFound)
    }

    /// All bindings at one level, in label order.
    pub fn scope(&self, level: usize) -> &Scope {
        &self.scopes[self.index_for_level(level)]
    }

    /// The outermost writable scope.
    pub fn global_scope(&self) -> &Scope {
        &self.scopes[0]
    }
}

/// Builds the predefined labels: registers, instruction forms, directives
/// and built-in functions.
pub fn system_dictionary() -> Scope {
    let mut scope = Scope::new();

    for x in 0..16 {
        scope.insert(format!("X{}", x), Value::integer(x));
        scope.insert(format!("EX{}", x), Value::integer(x));
        scope.insert(format!("A{}", x), Value::integer(x + 12));
        scope.insert(format!("EA{}", x), Value::integer(x + 12));
        scope.insert(format!("R{}", x), Value::integer(x + 64));
        scope.insert(format!("ER{}", x), Value::integer(x + 64));
    }
    for b in 0..32 {
        scope.insert(format!("B{}", b), Value::integer(b));
    }

    let forms: [(&str, &[u32]); 5] = [
        ("I$", &[6, 4, 4, 4, 1, 1, 16]),
        ("EI$", &[6, 4, 4, 4, 1, 1, 4, 12]),
        ("PF$FJAXU", &[6, 4, 4, 4, 18]),
        ("PF$FJAXHIU", &[6, 4, 4, 4, 1, 1, 16]),
        ("PF$FJAXHIBD", &[6, 4, 4, 4, 1, 1, 4, 12]),
    ];
    for (name, sizes) in forms.iter() {
        if let Ok(form) = Form::new(sizes.to_vec()) {
            scope.insert(name.to_string(), Value::form_value(form));
        }
    }

    for name in directives::names() {
        scope.insert(name.to_string(), Value::directive(name));
    }
    for name in functions::names() {
        scope.insert(name.to_string(), Value::built_in_function(name));
    }
    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::value::ValueKind;

    #[test]
    fn test_compile_once() {
        static GOOD: OnceLock<Option<Regex>> = OnceLock::new();
        static BAD: OnceLock<Option<Regex>> = OnceLock::new();
        let first = compile_once(&GOOD, LABEL_PATTERN).map(|re| re as *const Regex);
        assert!(first.is_some());
        assert_eq!(compile_once(&GOOD, LABEL_PATTERN).map(|re| re as *const Regex), first);
        assert!(compile_once(&BAD, r"^[unclosed").is_none());
    }

    #[test]
    fn test_valid_labels() {
        assert!(is_valid_label("A"));
        assert!(is_valid_label("$INFO"));
        assert!(is_valid_label("_under_score"));
        assert!(is_valid_label("ABCDEFGHIJKL"));
        assert!(!is_valid_label("ABCDEFGHIJKLM"));
        assert!(!is_valid_label("1ABC"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("A-B"));
    }

    #[test]
    fn test_valid_user_labels() {
        assert!(is_valid_user_label("START"));
        assert!(is_valid_user_label("X$1"));
        assert!(!is_valid_user_label("$START"));
    }

    #[test]
    fn test_round_trip() {
        let mut dict = Dictionary::new(Scope::new());
        dict.add_value(0, "foo", Value::integer(5));
        assert_eq!(dict.get_value("FOO"), Ok(&Value::integer(5)));
        assert_eq!(dict.get_value("Foo"), Ok(&Value::integer(5)));
        assert_eq!(dict.get_value("BAR"), Err(NotFound));
    }

    #[test]
    fn test_level_one_store() {
        let mut dict = Dictionary::new(Scope::new());
        dict.push_scope();
        dict.add_value(1, "OUTER", Value::integer(7));
        assert_eq!(dict.get_value("OUTER"), Ok(&Value::integer(7)));
        assert!(dict.has_value_at(1, "OUTER"));
        assert!(!dict.has_value_at(0, "OUTER"));

        dict.pop_scope();
        assert_eq!(dict.get_value("OUTER"), Ok(&Value::integer(7)));
    }

    #[test]
    fn test_inner_scope_shadows_and_discards() {
        let mut dict = Dictionary::new(Scope::new());
        dict.add_value(0, "X", Value::integer(1));
        dict.push_scope();
        dict.add_value(0, "X", Value::integer(2));
        assert_eq!(dict.get_value("X"), Ok(&Value::integer(2)));
        dict.pop_scope();
        assert_eq!(dict.get_value("X"), Ok(&Value::integer(1)));
        assert!(dict.pop_scope().is_none());
    }

    #[test]
    fn test_level_clamped_below_system() {
        let mut dict = Dictionary::new(system_dictionary());
        dict.add_value(5, "A0", Value::integer(99));
        assert_eq!(dict.get_value("A0"), Ok(&Value::integer(99)));
        assert_eq!(dict.depth(), 1);
    }

    #[test]
    fn test_system_dictionary() {
        let dict = Dictionary::new(system_dictionary());
        assert_eq!(dict.get_value("a5"), Ok(&Value::integer(17)));
        assert_eq!(dict.get_value("R15"), Ok(&Value::integer(79)));
        assert_eq!(dict.get_value("B31"), Ok(&Value::integer(31)));
        assert!(matches!(dict.get_value("$EQU").map(|v| &v.kind), Ok(ValueKind::Directive(_))));
        assert!(matches!(dict.get_value("$SL").map(|v| &v.kind), Ok(ValueKind::BuiltInFunction(_))));
        assert!(matches!(dict.get_value("I$").map(|v| &v.kind), Ok(ValueKind::Form(_))));
    }
}
