//! Search normalisation, Soundex, and ranking.
//!
//! Pipeline:
//!   raw text
//!     └─ normalize()       → lowercase, diacritics stripped, single spaces
//!          └─ tokens()        → Vec<String>
//!               └─ soundex()     → 4-character phonetic code per token
//!
//! Indexing and querying run the exact same pipeline, so a document and a
//! query only need to agree on tokens.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::entity::{ObjectType, ScopeLevel};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

const EXACT_WEIGHT: u32 = 3;
const VARIANT_WEIGHT: u32 = 2;
const PHONETIC_WEIGHT: u32 = 1;

// ─── Normalisation ───────────────────────────────────────────────────────────

/// Lowercase, strip diacritics, collapse non-alphanumerics to single spaces.
///
/// The Catalan middle dot (`l·l`) joins rather than separates.
pub fn normalize(raw: &str) -> String {
  let mut out = String::with_capacity(raw.len());
  let mut pending_space = false;
  for c in raw.nfd().filter(|c| !is_combining_mark(*c)) {
    if c == '·' || c == '\'' || c == '’' {
      continue;
    }
    if c.is_alphanumeric() {
      if pending_space && !out.is_empty() {
        out.push(' ');
      }
      pending_space = false;
      out.extend(c.to_lowercase());
    } else {
      pending_space = true;
    }
  }
  out
}

/// Normalised tokens of `raw`, in order, duplicates kept.
pub fn tokens(raw: &str) -> Vec<String> {
  normalize(raw).split(' ').filter(|t| !t.is_empty()).map(str::to_owned).collect()
}

// ─── Soundex ─────────────────────────────────────────────────────────────────

fn soundex_digit(c: char) -> u8 {
  match c {
    'b' | 'f' | 'p' | 'v' => b'1',
    'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => b'2',
    'd' | 't' => b'3',
    'l' => b'4',
    'm' | 'n' => b'5',
    'r' => b'6',
    _ => b'0',
  }
}

/// American Soundex of a normalised token: first letter plus three digits,
/// right-padded with `0`. Returns `None` for tokens not starting with a
/// letter.
pub fn soundex(token: &str) -> Option<String> {
  let mut chars = token.chars().filter(|c| c.is_ascii_alphanumeric());
  let first = chars.next().filter(char::is_ascii_alphabetic)?;
  let first = first.to_ascii_lowercase();

  let mut code = String::with_capacity(4);
  code.push(first.to_ascii_uppercase());
  let mut last = soundex_digit(first);

  for c in chars {
    if code.len() == 4 {
      break;
    }
    let c = c.to_ascii_lowercase();
    let digit = soundex_digit(c);
    if digit == b'0' {
      // `h` and `w` do not separate equal codes; vowels do.
      if c != 'h' && c != 'w' {
        last = b'0';
      }
      continue;
    }
    if digit != last {
      code.push(digit as char);
    }
    last = digit;
  }
  while code.len() < 4 {
    code.push('0');
  }
  Some(code)
}

/// Unique Soundex codes of `tokens`, space-separated, in first-seen order.
pub fn phonetic_field<S: AsRef<str>>(tokens: &[S]) -> String {
  let mut seen = BTreeSet::new();
  let mut out: Vec<String> = Vec::new();
  for code in tokens.iter().filter_map(|t| soundex(t.as_ref())) {
    if seen.insert(code.clone()) {
      out.push(code);
    }
  }
  out.join(" ")
}

// ─── Documents ───────────────────────────────────────────────────────────────

/// A denormalised search row keyed by `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDoc {
  pub entity_type:             ObjectType,
  pub entity_id:               i64,
  pub published:               bool,
  pub label:                   String,
  pub person_tokens_norm:      String,
  pub cognoms_tokens_norm:     String,
  pub phonetic:                String,
  /// Normalised key of the first canonical surname, if any.
  pub cognom_canonical:        Option<String>,
  pub municipi_id:             Option<i64>,
  pub arxiu_id:                Option<i64>,
  pub llibre_id:               Option<i64>,
  pub entitat_eclesiastica_id: Option<i64>,
  pub any_acte:                Option<i32>,
}

impl SearchDoc {
  /// Build a document from free text and already-canonicalised surname keys.
  pub fn new(
    entity_type: ObjectType,
    entity_id: i64,
    label: impl Into<String>,
    text: &[&str],
    canonical_cognoms: &[String],
  ) -> Self {
    let mut person: Vec<String> = text.iter().flat_map(|t| tokens(t)).collect();
    let cognoms: Vec<String> =
      canonical_cognoms.iter().flat_map(|c| tokens(c)).collect();
    for c in &cognoms {
      if !person.contains(c) {
        person.push(c.clone());
      }
    }
    Self {
      entity_type,
      entity_id,
      published: false,
      label: label.into(),
      phonetic: phonetic_field(&person),
      person_tokens_norm: person.join(" "),
      cognom_canonical: cognoms.first().cloned(),
      cognoms_tokens_norm: cognoms.join(" "),
      municipi_id: None,
      arxiu_id: None,
      llibre_id: None,
      entitat_eclesiastica_id: None,
      any_acte: None,
    }
  }

  fn has_token(&self, token: &str) -> bool {
    self.person_tokens_norm.split(' ').any(|t| t == token)
      || self.cognoms_tokens_norm.split(' ').any(|t| t == token)
  }

  fn has_cognom(&self, clau: &str) -> bool {
    self.cognoms_tokens_norm.split(' ').any(|t| t == clau)
  }

  fn has_phonetic(&self, code: &str) -> bool {
    self.phonetic.split(' ').any(|c| c == code)
  }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Parameters for a faceted search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
  #[serde(default)]
  pub q:                       String,
  pub entity:                  Option<ObjectType>,
  pub ancestor_type:           Option<ScopeLevel>,
  pub ancestor_id:             Option<i64>,
  /// Lower year bound; malformed values are ignored.
  pub from:                    Option<String>,
  pub to:                      Option<String>,
  pub entitat_eclesiastica_id: Option<i64>,
  #[serde(default)]
  pub page:                    usize,
  #[serde(default)]
  pub page_size:               usize,
}

impl SearchQuery {
  pub fn text(q: impl Into<String>) -> Self {
    Self { q: q.into(), ..Self::default() }
  }

  pub fn year_range(&self) -> (Option<i32>, Option<i32>) {
    (
      self.from.as_deref().and_then(year_bound),
      self.to.as_deref().and_then(year_bound),
    )
  }

  /// `(page, page_size)` clamped to sane values; pages are 1-based.
  pub fn paging(&self) -> (usize, usize) {
    let size = match self.page_size {
      0 => DEFAULT_PAGE_SIZE,
      n => n.min(MAX_PAGE_SIZE),
    };
    (self.page.max(1), size)
  }
}

/// Parse `YYYY` or an ISO date prefix into a year; anything else is ignored.
pub fn year_bound(raw: &str) -> Option<i32> {
  let raw = raw.trim();
  let year = raw.get(..4)?;
  if !year.chars().all(|c| c.is_ascii_digit()) {
    return None;
  }
  let rest = &raw[4..];
  if !rest.is_empty()
    && chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_err()
  {
    return None;
  }
  year.parse().ok()
}

/// The tokenised query with surname variants already resolved.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
  pub terms: Vec<QueryTerm>,
}

#[derive(Debug, Clone)]
pub struct QueryTerm {
  pub token:      String,
  pub soundex:    Option<String>,
  /// Canonical surname keys this token is a variant or alias of.
  pub canonicals: Vec<String>,
}

impl QueryPlan {
  /// Tokenise `q`; `canonicals_for` resolves variant/alias keys per token.
  pub fn build(q: &str, mut canonicals_for: impl FnMut(&str) -> Vec<String>) -> Self {
    let mut seen = BTreeSet::new();
    let terms = tokens(q)
      .into_iter()
      .filter(|t| seen.insert(t.clone()))
      .map(|token| QueryTerm {
        soundex: soundex(&token),
        canonicals: canonicals_for(&token),
        token,
      })
      .collect();
    Self { terms }
  }

  pub fn is_empty(&self) -> bool { self.terms.is_empty() }

  /// `3·exact + 2·variant + 1·phonetic`, summed over query terms.
  pub fn score(&self, doc: &SearchDoc) -> u32 {
    self
      .terms
      .iter()
      .map(|term| {
        let exact = doc.has_token(&term.token);
        let mut s = 0;
        if exact {
          s += EXACT_WEIGHT;
        } else if term.canonicals.iter().any(|c| doc.has_cognom(c)) {
          s += VARIANT_WEIGHT;
        }
        if term.soundex.as_deref().is_some_and(|code| doc.has_phonetic(code)) {
          s += PHONETIC_WEIGHT;
        }
        s
      })
      .sum()
  }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
  pub entity_type: ObjectType,
  pub entity_id:   i64,
  pub label:       String,
  pub score:       u32,
  pub any_acte:    Option<i32>,
  pub municipi_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
  pub items:       Vec<SearchHit>,
  pub total:       usize,
  pub total_pages: usize,
}

/// Score, order and paginate candidate documents that already passed the
/// facet filters.
///
/// With an empty plan every candidate is kept and ordering falls back to
/// `any_acte desc, entity_id`.
pub fn rank(docs: Vec<SearchDoc>, plan: &QueryPlan, query: &SearchQuery) -> SearchPage {
  let mut hits: Vec<SearchHit> = docs
    .into_iter()
    .filter_map(|doc| {
      let score = plan.score(&doc);
      if !plan.is_empty() && score == 0 {
        return None;
      }
      Some(SearchHit {
        entity_type: doc.entity_type,
        entity_id: doc.entity_id,
        label: doc.label,
        score,
        any_acte: doc.any_acte,
        municipi_id: doc.municipi_id,
      })
    })
    .collect();

  hits.sort_by(|a, b| {
    b.score
      .cmp(&a.score)
      .then_with(|| b.any_acte.cmp(&a.any_acte))
      .then_with(|| a.entity_id.cmp(&b.entity_id))
      .then_with(|| a.entity_type.cmp(&b.entity_type))
  });

  let total = hits.len();
  let (page, size) = query.paging();
  let total_pages = total.div_ceil(size);
  let skip = page.saturating_sub(1).saturating_mul(size);
  let items = hits.into_iter().skip(skip).take(size).collect();
  SearchPage { items, total, total_pages }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_strips_diacritics_and_punctuation() {
    assert_eq!(normalize("  Josép-Maria  GARCÍA, i Puig "), "josep maria garcia i puig");
    assert_eq!(normalize("Pal·larès"), "pallares");
    assert_eq!(normalize("Çanyelles"), "canyelles");
    assert_eq!(normalize("¿?"), "");
  }

  #[test]
  fn soundex_codes() {
    assert_eq!(soundex("robert").as_deref(), Some("R163"));
    assert_eq!(soundex("rupert").as_deref(), Some("R163"));
    assert_eq!(soundex("ashcraft").as_deref(), Some("A261"));
    assert_eq!(soundex("tymczak").as_deref(), Some("T522"));
    assert_eq!(soundex("moia").as_deref(), Some("M000"));
    assert_eq!(soundex("moya").as_deref(), Some("M000"));
    assert_eq!(soundex("1890"), None);
  }

  #[test]
  fn phonetic_field_is_unique_and_ordered() {
    assert_eq!(phonetic_field(&["moia", "moya", "joan"]), "M000 J500");
  }

  #[test]
  fn year_bounds_ignore_garbage() {
    assert_eq!(year_bound("1890"), Some(1890));
    assert_eq!(year_bound("1890-02-03"), Some(1890));
    assert_eq!(year_bound("18x0"), None);
    assert_eq!(year_bound("1890-13-40"), None);
    assert_eq!(year_bound(""), None);
  }

  fn persona(id: i64, nom: &str, cognom: &str, any: Option<i32>) -> SearchDoc {
    let mut doc = SearchDoc::new(
      ObjectType::Persona,
      id,
      format!("{nom} {cognom}"),
      &[nom],
      &[cognom.to_owned()],
    );
    doc.published = true;
    doc.any_acte = any;
    doc
  }

  #[test]
  fn variant_match_ranks_below_exact_match() {
    let docs = vec![persona(1, "Joan", "Moia", None), persona(2, "Pere", "Moya", None)];
    let plan = QueryPlan::build("Moya", |t| {
      if t == "moya" { vec!["moia".to_owned()] } else { vec![] }
    });
    let page = rank(docs, &plan, &SearchQuery::text("Moya"));
    let ids: Vec<i64> = page.items.iter().map(|h| h.entity_id).collect();
    assert_eq!(ids, vec![2, 1]);
    assert_eq!(page.items[0].score, 4);
    assert_eq!(page.items[1].score, 3);
  }

  #[test]
  fn empty_query_orders_by_year_desc() {
    let docs = vec![
      persona(1, "A", "B", Some(1800)),
      persona(2, "C", "D", None),
      persona(3, "E", "F", Some(1900)),
    ];
    let page = rank(docs, &QueryPlan::default(), &SearchQuery::default());
    let ids: Vec<i64> = page.items.iter().map(|h| h.entity_id).collect();
    assert_eq!(ids, vec![3, 1, 2]);
  }

  #[test]
  fn pagination_counts_pages() {
    let docs = (1..=45).map(|i| persona(i, "Joan", "Puig", None)).collect();
    let query = SearchQuery { q: "puig".into(), page: 3, page_size: 20, ..Default::default() };
    let plan = QueryPlan::build(&query.q, |_| vec![]);
    let page = rank(docs, &plan, &query);
    assert_eq!(page.total, 45);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items.len(), 5);
  }

  #[test]
  fn pages_past_the_end_are_empty() {
    let docs = (1..=3).map(|i| persona(i, "Joan", "Puig", None)).collect();
    let query = SearchQuery { page: usize::MAX, ..Default::default() };
    let page = rank(docs, &QueryPlan::default(), &query);
    assert!(page.items.is_empty());
    assert_eq!(page.total, 3);
    assert_eq!(page.total_pages, 1);
  }
}
