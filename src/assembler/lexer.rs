//! The line splitter breaks one line of source into fields, and each field
//! into comma-delimited subfields.
//!
//! Fields are separated by blanks. A blank does not end a field while inside
//! quotes or parentheses, directly after a comma, or directly after a leading
//! sign, so `A, B` and `+ 5` each stay a single field.
use super::diagnostic::{Diagnostic, Diagnostics, Locale};
use std::io::{BufRead, BufReader, Read};

/// One raw line of source and its one-based line number.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SourceLine {
    pub number: usize,
    pub text: String,
}

impl SourceLine {
    pub fn new<S: Into<String>>(number: usize, text: S) -> Self {
        SourceLine { number, text: text.into() }
    }
}

/// Numbers a list of lines starting from 1.
pub fn source_lines<S: AsRef<str>>(lines: &[S]) -> Vec<SourceLine> {
    lines
        .iter()
        .enumerate()
        .map(|(index, text)| SourceLine::new(index + 1, text.as_ref()))
        .collect()
}

/// Reads every line from a reader. Unreadable lines are reported and counted;
/// any failure rejects the whole source.
pub fn read_source<T: Read + ?Sized>(reader: Box<T>) -> Result<Vec<SourceLine>, String> {
    let mut lines = Vec::with_capacity(256);
    let mut error_count: usize = 0;

    for (index, line) in BufReader::new(reader).lines().enumerate() {
        match line {
            Ok(s) => lines.push(SourceLine::new(index + 1, s)),
            Err(e) => {
                error_count += 1;
                error!("Error reading line {}: {}", index + 1, e.to_string());
            }
        }
    }

    if error_count > 0 {
        return Err(format!("{} line(s) could not be read", error_count));
    }
    Ok(lines)
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TextSubfield {
    pub text: String,
    pub locale: Locale,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TextField {
    pub text: String,
    pub locale: Locale,
    pub subfields: Vec<TextSubfield>,
}

impl TextField {
    /// The subfield at `index`, or `None` when it is absent or empty.
    pub fn subfield(&self, index: usize) -> Option<&TextSubfield> {
        self.subfields.get(index).filter(|sf| !sf.text.is_empty())
    }

    pub fn subfield_count(&self) -> usize {
        self.subfields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TextLine {
    pub number: usize,
    pub text: String,
    pub fields: Vec<TextField>,
    pub diagnostics: Diagnostics,
}

impl TextLine {
    /// The field at `index`, or `None` when it is absent or empty.
    pub fn field(&self, index: usize) -> Option<&TextField> {
        self.fields.get(index).filter(|f| !f.is_empty())
    }
}

/// Strips commentary. A line that is exactly `.` or begins with `. ` is all
/// comment; elsewhere an unquoted ` .` followed by a blank or the end of the
/// line ends the useful text.
pub fn remove_comments(text: &str) -> &str {
    if text == "." || text.starts_with(". ") {
        return "";
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut quoted = false;
    let mut prev_space = false;
    for (cx, &(offset, c)) in chars.iter().enumerate() {
        if !quoted && c == '.' && prev_space {
            match chars.get(cx + 1) {
                None | Some((_, ' ')) => return text[..offset].trim_end(),
                _ => {}
            }
        }
        prev_space = c == ' ';
        if c == '\'' {
            quoted = !quoted;
        }
    }
    text
}

/// Splits one source line into fields.
///
/// A line beginning with a blank has no label; an empty first field stands
/// in for it so operation fields are always at index 1.
pub fn split_line(source: &SourceLine) -> TextLine {
    let mut line = TextLine {
        number: source.number,
        text: source.text.clone(),
        fields: Vec::with_capacity(4),
        diagnostics: Diagnostics::new(),
    };

    let clean: Vec<char> = remove_comments(&source.text).chars().map(|c| if c == '\t' { ' ' } else { c }).collect();
    let mut tx = 0;
    if clean.first() == Some(&' ') {
        while tx < clean.len() && clean[tx] == ' ' {
            tx += 1;
        }
        line.fields.push(TextField {
            text: String::new(),
            locale: Locale::new(source.number, 1),
            subfields: Vec::new(),
        });
    }

    let mut paren_level: usize = 0;
    let mut prev_comma = false;
    let mut prev_sign = false;
    let mut quoted = false;
    let mut sb = String::new();
    let mut locale = Locale::new(source.number, tx + 1);

    while tx < clean.len() {
        let c = clean[tx];
        tx += 1;

        if quoted {
            sb.push(c);
        } else if paren_level == 0 && c == ' ' {
            if prev_comma || prev_sign {
                // Embedded blanks stay with the field.
                sb.push(c);
                while tx < clean.len() && clean[tx] == ' ' {
                    sb.push(' ');
                    tx += 1;
                }
            } else {
                let field = make_field(sb.trim(), locale, &mut line.diagnostics);
                line.fields.push(field);
                while tx < clean.len() && clean[tx] == ' ' {
                    tx += 1;
                }
                sb.clear();
                locale = Locale::new(source.number, tx + 1);
            }
        } else {
            sb.push(c);
            match c {
                '(' => paren_level += 1,
                ')' => {
                    if paren_level == 0 {
                        line.diagnostics.append(Diagnostic::error(
                            Locale::new(source.number, tx),
                            "Too many closing parentheses",
                        ));
                        return line;
                    }
                    paren_level -= 1;
                }
                _ => {}
            }
        }

        if c == '\'' {
            quoted = !quoted;
        }
        prev_comma = c == ',';
        prev_sign = sb.len() == 1 && (c == '+' || c == '-');
    }

    let remaining = sb.trim();
    if !remaining.is_empty() {
        let field = make_field(remaining, locale, &mut line.diagnostics);
        line.fields.push(field);
    }

    let end = Locale::new(source.number, tx.max(1));
    if quoted {
        line.diagnostics.append(Diagnostic::quote(end, "Unterminated string"));
    }
    if paren_level > 0 {
        line.diagnostics.append(Diagnostic::error(end, "Unterminated parenthesized expression"));
    }
    line
}

fn make_field(text: &str, locale: Locale, diagnostics: &mut Diagnostics) -> TextField {
    TextField {
        text: text.to_string(),
        locale,
        subfields: split_subfields(text, locale, diagnostics),
    }
}

/// Splits a field on commas outside quotes and parentheses. Blanks after a
/// comma are skipped; an empty subfield is kept as a placeholder.
fn split_subfields(text: &str, field_locale: Locale, diagnostics: &mut Diagnostics) -> Vec<TextSubfield> {
    let chars: Vec<char> = text.chars().collect();
    let mut subfields = Vec::new();
    if chars.is_empty() {
        return subfields;
    }

    let mut paren_level: usize = 0;
    let mut quoted = false;
    let mut sb = String::new();
    let mut locale = field_locale;
    let mut tx = 0;

    while tx < chars.len() {
        let c = chars[tx];
        tx += 1;

        if quoted {
            sb.push(c);
        } else if paren_level == 0 && c == ',' {
            subfields.push(TextSubfield { text: sb.trim_end().to_string(), locale });
            while tx < chars.len() && chars[tx] == ' ' {
                tx += 1;
            }
            sb.clear();
            locale = field_locale.offset(tx);
        } else {
            sb.push(c);
            if c == '(' {
                paren_level += 1;
            } else if c == ')' {
                if paren_level == 0 {
                    diagnostics.append(Diagnostic::error(field_locale.offset(tx - 1), "Too many closing parentheses"));
                    return subfields;
                }
                paren_level -= 1;
            }
        }

        if c == '\'' {
            quoted = !quoted;
        }
    }

    subfields.push(TextSubfield { text: sb.trim_end().to_string(), locale });
    subfields
}
