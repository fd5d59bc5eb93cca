//! Code-aware term extraction.
//!
//! Produces a lazy sequence of lowercased terms from a text blob plus an
//! optional language tag. Raw words are split on non-alphanumeric
//! boundaries (underscore kept, so identifiers survive whole), then each
//! identifier is further split on camelCase and snake_case boundaries.
//! Both the compound identifier and its parts are emitted:
//! `getUserAuth` → `getuserauth`, `get`, `user`, `auth`.
//!
//! Terms shorter than two characters are dropped, as are stopwords. The
//! stopword list is small and depends on the language tag: a common English
//! base plus the keywords of the tagged language, so `fn` or `return` never
//! pollute the index while ordinary identifiers pass through.

use std::collections::{HashMap, VecDeque};

use crate::domain::Language;

/// Minimum length for an emitted term.
const MIN_TERM_LEN: usize = 2;

/// Common English stopwords applied regardless of language.
const COMMON_STOPWORDS: &[&str] = &[
  "the", "and", "for", "not", "with", "this", "that", "from", "are", "was", "were", "you", "all", "can", "has",
  "have", "had", "will", "would", "but", "its", "into", "out", "our", "your", "their", "then", "than", "when",
];

const RUST_STOPWORDS: &[&str] = &[
  "fn", "let", "mut", "pub", "use", "impl", "struct", "enum", "match", "mod", "crate", "self", "super", "trait",
  "where", "async", "await", "dyn", "ref", "return", "true", "false", "some", "none",
];

const TS_JS_STOPWORDS: &[&str] = &[
  "const", "var", "let", "function", "return", "export", "import", "default", "new", "typeof", "interface",
  "type", "class", "extends", "implements", "await", "async", "null", "undefined", "true", "false",
];

const PYTHON_STOPWORDS: &[&str] = &[
  "def", "class", "import", "from", "return", "self", "none", "true", "false", "lambda", "pass", "elif", "else",
  "with", "yield",
];

const GO_STOPWORDS: &[&str] = &[
  "func", "package", "import", "return", "var", "type", "struct", "interface", "defer", "chan", "nil", "range",
  "true", "false",
];

/// Stopword slice for a language tag.
fn language_stopwords(language: Option<Language>) -> &'static [&'static str] {
  match language {
    Some(Language::Rust) => RUST_STOPWORDS,
    Some(Language::TypeScript) | Some(Language::JavaScript) => TS_JS_STOPWORDS,
    Some(Language::Python) => PYTHON_STOPWORDS,
    Some(Language::Go) => GO_STOPWORDS,
    _ => &[],
  }
}

fn is_stopword(term: &str, language: Option<Language>) -> bool {
  COMMON_STOPWORDS.contains(&term) || language_stopwords(language).contains(&term)
}

fn is_word_boundary(c: char) -> bool {
  !(c.is_alphanumeric() || c == '_')
}

// ============================================================================
// Token Iterator
// ============================================================================

/// Lazy iterator over the terms of a text blob.
///
/// Same input always yields the same sequence.
pub struct Tokens<'a> {
  words: std::str::Split<'a, fn(char) -> bool>,
  language: Option<Language>,
  queue: VecDeque<String>,
}

impl Iterator for Tokens<'_> {
  type Item = String;

  fn next(&mut self) -> Option<String> {
    loop {
      if let Some(term) = self.queue.pop_front() {
        return Some(term);
      }
      let word = self.words.next()?;
      self.expand_word(word);
    }
  }
}

impl Tokens<'_> {
  /// Push the compound form and identifier parts of one raw word.
  fn expand_word(&mut self, word: &str) {
    if word.is_empty() {
      return;
    }

    let compound = word.to_lowercase();
    let parts = split_identifier(word);

    if parts.len() > 1 {
      self.push_term(compound);
      for part in parts {
        self.push_term(part);
      }
    } else {
      // Single-part identifiers would duplicate their compound form.
      self.push_term(compound);
    }
  }

  fn push_term(&mut self, term: String) {
    if term.len() >= MIN_TERM_LEN && !is_stopword(&term, self.language) {
      self.queue.push_back(term);
    }
  }
}

/// Split an identifier on snake_case and camelCase boundaries, lowercasing
/// each part. An uppercase run followed by a lowercase letter breaks before
/// its last character, so `HTTPServer` → `http`, `server`.
fn split_identifier(word: &str) -> Vec<String> {
  let chars: Vec<char> = word.chars().collect();
  let mut parts = Vec::new();
  let mut current = String::new();

  for (i, &c) in chars.iter().enumerate() {
    if c == '_' {
      if !current.is_empty() {
        parts.push(std::mem::take(&mut current));
      }
      continue;
    }
    if i > 0 && !current.is_empty() {
      let prev = chars[i - 1];
      let camel_start = prev.is_lowercase() && c.is_uppercase();
      let acronym_end =
        prev.is_uppercase() && c.is_uppercase() && chars.get(i + 1).is_some_and(|n| n.is_lowercase());
      if camel_start || acronym_end {
        parts.push(std::mem::take(&mut current));
      }
    }
    current.extend(c.to_lowercase());
  }
  if !current.is_empty() {
    parts.push(current);
  }

  parts
}

/// Tokenize a text blob with an optional language tag.
pub fn tokenize(text: &str, language: Option<Language>) -> Tokens<'_> {
  Tokens {
    words: text.split(is_word_boundary as fn(char) -> bool),
    language,
    queue: VecDeque::new(),
  }
}

/// Build the term-frequency map of a document in one pass.
pub fn term_frequencies(text: &str, language: Option<Language>) -> HashMap<String, u32> {
  let mut tf = HashMap::new();
  for term in tokenize(text, language) {
    *tf.entry(term).or_insert(0) += 1;
  }
  tf
}
