//! Search documents and the admin closure.
//!
//! Documents are rebuilt from their entity inside the same transaction as the
//! write that touched it, so `published` never lags the entity's state.

use llinatge_core::{
  entity::{ModerationState, Municipi, ObjectType, closure_rows},
  search::{QueryPlan, SearchDoc, SearchPage, SearchQuery, normalize},
  store::Search,
};
use rusqlite::{Connection, OptionalExtension as _, types::Value};

use crate::{
  Result, SqliteStore,
  db::Ctx,
  encode::{decode_enum, encode_enum},
  registry,
};

/// Entity types that own a search document.
pub(crate) const INDEXED: [ObjectType; 6] = [
  ObjectType::Persona,
  ObjectType::Transcripcio,
  ObjectType::Municipi,
  ObjectType::Cognom,
  ObjectType::Llibre,
  ObjectType::Esdeveniment,
];

// ─── Admin closure ───────────────────────────────────────────────────────────

/// Replace a municipality's closure rows. A municipality without a país of
/// its own inherits its nivell's.
pub(crate) fn refresh_closure(conn: &Connection, municipi_id: i64) -> Result<()> {
  let municipi = conn
    .query_row(
      "SELECT m.id, m.nom, COALESCE(m.pais_id, n.pais_id), m.nivell_admin_id, m.comarca_id, \
              m.created_by
         FROM municipis m LEFT JOIN nivells_administratius n ON n.id = m.nivell_admin_id
        WHERE m.id = ?1",
      [municipi_id],
      |r| {
        Ok(Municipi {
          id:               r.get(0)?,
          nom:              r.get(1)?,
          pais_id:          r.get(2)?,
          nivell_admin_id:  r.get(3)?,
          comarca_id:       r.get(4)?,
          moderation_state: ModerationState::default(),
          created_by:       r.get(5)?,
        })
      },
    )
    .optional()?;

  conn.execute("DELETE FROM admin_closure WHERE municipi_id = ?1", [municipi_id])?;
  let Some(municipi) = municipi else {
    return Ok(());
  };
  let mut insert = conn.prepare_cached(
    "INSERT INTO admin_closure (municipi_id, ancestor_type, ancestor_id) VALUES (?1, ?2, ?3)",
  )?;
  for row in closure_rows(&municipi) {
    insert.execute(rusqlite::params![
      row.municipi_id,
      encode_enum(row.ancestor_type),
      row.ancestor_id
    ])?;
  }
  Ok(())
}

/// Re-derive the closure of every municipality hanging from a nivell.
pub(crate) fn refresh_closure_under_nivell(conn: &Connection, nivell_id: i64) -> Result<()> {
  let ids: Vec<i64> = conn
    .prepare("SELECT id FROM municipis WHERE nivell_admin_id = ?1")?
    .query_map([nivell_id], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;
  for id in ids {
    refresh_closure(conn, id)?;
  }
  Ok(())
}

// ─── Surname resolution ──────────────────────────────────────────────────────

/// The canonical key for a surname spelling: variants resolve to their
/// cognom, aliases follow one redirect hop. Unknown spellings keep their own
/// normalised key.
pub(crate) fn canonical_clau(conn: &Connection, raw: &str) -> Result<Option<String>> {
  let clau = normalize(raw);
  if clau.is_empty() {
    return Ok(None);
  }
  let direct: Option<String> = conn
    .query_row(
      "SELECT COALESCE(t.clau, c.clau)
         FROM cognoms c LEFT JOIN cognoms t ON t.id = c.redirect_to_id
        WHERE c.clau = ?1",
      [&clau],
      |r| r.get(0),
    )
    .optional()?;
  if let Some(found) = direct {
    return Ok(Some(found));
  }
  let via_variant: Option<String> = conn
    .query_row(
      "SELECT COALESCE(t.clau, c.clau)
         FROM cognom_variants v
         JOIN cognoms c ON c.id = v.cognom_id
         LEFT JOIN cognoms t ON t.id = c.redirect_to_id
        WHERE v.clau = ?1
        ORDER BY v.id LIMIT 1",
      [&clau],
      |r| r.get(0),
    )
    .optional()?;
  Ok(Some(via_variant.unwrap_or(clau)))
}

/// Canonical keys a query token is a variant or alias of (never itself).
fn canonicals_for(conn: &Connection, token: &str) -> Result<Vec<String>> {
  let mut stmt = conn.prepare_cached(
    "SELECT COALESCE(t.clau, c.clau)
       FROM cognom_variants v
       JOIN cognoms c ON c.id = v.cognom_id
       LEFT JOIN cognoms t ON t.id = c.redirect_to_id
      WHERE v.clau = ?1
     UNION
     SELECT t.clau
       FROM cognoms c JOIN cognoms t ON t.id = c.redirect_to_id
      WHERE c.clau = ?1",
  )?;
  let found = stmt
    .query_map([token], |r| r.get::<_, String>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(found.into_iter().filter(|c| c != token).collect())
}

fn canonical_list(conn: &Connection, surnames: &[Option<String>]) -> Result<Vec<String>> {
  let mut out = Vec::new();
  for s in surnames.iter().flatten() {
    if let Some(c) = canonical_clau(conn, s)?
      && !out.contains(&c)
    {
      out.push(c);
    }
  }
  Ok(out)
}

// ─── Documents ───────────────────────────────────────────────────────────────

fn join_names(parts: &[Option<String>]) -> String {
  parts
    .iter()
    .flatten()
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

struct LlibreFacets {
  arxiu_id:    Option<i64>,
  municipi_id: Option<i64>,
  entitat_id:  Option<i64>,
}

fn llibre_facets(conn: &Connection, llibre_id: i64) -> Result<Option<LlibreFacets>> {
  Ok(
    conn
      .query_row(
        "SELECT arxiu_id, municipi_id, entitat_eclesiastica_id FROM llibres WHERE id = ?1",
        [llibre_id],
        |r| {
          Ok(LlibreFacets {
            arxiu_id:    r.get(0)?,
            municipi_id: r.get(1)?,
            entitat_id:  r.get(2)?,
          })
        },
      )
      .optional()?,
  )
}

/// Compute the document for one entity; `None` when the row is gone or the
/// type is not indexed.
pub(crate) fn build_doc(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
) -> Result<Option<SearchDoc>> {
  if !INDEXED.contains(&object_type) {
    return Ok(None);
  }
  let Some(snap) = registry::load(conn, ctx, object_type, id)? else {
    return Ok(None);
  };
  let f = &snap.fields;
  let s = |k: &str| f.get(k).and_then(|v| v.as_str()).map(str::to_owned);
  let n = |k: &str| f.get(k).and_then(serde_json::Value::as_i64);

  let mut doc = match object_type {
    ObjectType::Persona => {
      let names = [s("nom"), s("cognom1"), s("cognom2")];
      let label = join_names(&names);
      let canon = canonical_list(conn, &[s("cognom1"), s("cognom2")])?;
      let text = names.iter().flatten().map(String::as_str).collect::<Vec<_>>();
      let mut doc = SearchDoc::new(object_type, id, label, &text, &canon);
      doc.municipi_id = n("municipi_id");
      doc.any_acte = s("data_naixement").and_then(|d| d.get(..4)?.parse().ok());
      doc
    }
    ObjectType::Transcripcio => {
      let people: Vec<[Option<String>; 3]> = conn
        .prepare_cached(
          "SELECT nom, cognom1, cognom2 FROM transcripcions_persona_raw
            WHERE transcripcio_id = ?1 ORDER BY id",
        )?
        .query_map([id], |r| Ok([r.get(0)?, r.get(1)?, r.get(2)?]))?
        .collect::<rusqlite::Result<_>>()?;
      let tipus = s("tipus_acte").unwrap_or_default();
      let any = n("any_doc");
      let principal = people.first().map(|p| join_names(p)).unwrap_or_default();
      let label = match (principal.is_empty(), any) {
        (false, Some(any)) => format!("{principal} ({tipus} {any})"),
        (false, None) => format!("{principal} ({tipus})"),
        (true, Some(any)) => format!("{tipus} {any}"),
        (true, None) => tipus.clone(),
      };
      let surnames: Vec<Option<String>> =
        people.iter().flat_map(|p| [p[1].clone(), p[2].clone()]).collect();
      let canon = canonical_list(conn, &surnames)?;
      let text: Vec<&str> =
        people.iter().flat_map(|p| p.iter().flatten().map(String::as_str)).collect();
      let mut doc = SearchDoc::new(object_type, id, label, &text, &canon);
      let llibre = match n("llibre_id") {
        Some(l) => llibre_facets(conn, l)?,
        None => None,
      };
      doc.llibre_id = n("llibre_id");
      doc.municipi_id = n("municipi_id").or(llibre.as_ref().and_then(|l| l.municipi_id));
      doc.arxiu_id = llibre.as_ref().and_then(|l| l.arxiu_id);
      doc.entitat_eclesiastica_id = llibre.as_ref().and_then(|l| l.entitat_id);
      doc.any_acte = any.and_then(|a| i32::try_from(a).ok());
      doc
    }
    ObjectType::Municipi => {
      let nom = s("nom").unwrap_or_default();
      let mut doc = SearchDoc::new(object_type, id, nom.clone(), &[nom.as_str()], &[]);
      doc.municipi_id = Some(id);
      doc
    }
    ObjectType::Cognom => {
      let forma = s("forma").unwrap_or_default();
      let variants: Vec<String> = conn
        .prepare_cached("SELECT variant FROM cognom_variants WHERE cognom_id = ?1 ORDER BY id")?
        .query_map([id], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;
      let mut text = vec![forma.as_str()];
      text.extend(variants.iter().map(String::as_str));
      let canon = canonical_list(conn, &[Some(forma.clone())])?;
      SearchDoc::new(object_type, id, forma.clone(), &text, &canon)
    }
    ObjectType::Llibre => {
      let titol = s("titol").unwrap_or_default();
      let codi = s("codi");
      let mut text = vec![titol.as_str()];
      text.extend(codi.as_deref());
      let mut doc = SearchDoc::new(object_type, id, titol.clone(), &text, &[]);
      doc.llibre_id = Some(id);
      doc.arxiu_id = n("arxiu_id");
      doc.municipi_id = n("municipi_id");
      doc.entitat_eclesiastica_id = n("entitat_eclesiastica_id");
      doc
    }
    ObjectType::Esdeveniment => {
      let titol = s("titol").unwrap_or_default();
      let descripcio = s("descripcio").unwrap_or_default();
      let mut doc =
        SearchDoc::new(object_type, id, titol.clone(), &[titol.as_str(), descripcio.as_str()], &[]);
      doc.municipi_id = n("municipi_id");
      doc.any_acte = n("any_esdeveniment").and_then(|a| i32::try_from(a).ok());
      doc
    }
    _ => return Ok(None),
  };
  doc.published = snap.moderation_state.is_published();
  Ok(Some(doc))
}

pub(crate) fn upsert_doc(conn: &Connection, doc: &SearchDoc) -> Result<()> {
  conn
    .prepare_cached(
      "INSERT INTO search_docs (
         entity_type, entity_id, published, label, person_tokens_norm, cognoms_tokens_norm,
         phonetic, cognom_canonical, municipi_id, arxiu_id, llibre_id,
         entitat_eclesiastica_id, any_acte
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
       ON CONFLICT (entity_type, entity_id) DO UPDATE SET
         published = excluded.published,
         label = excluded.label,
         person_tokens_norm = excluded.person_tokens_norm,
         cognoms_tokens_norm = excluded.cognoms_tokens_norm,
         phonetic = excluded.phonetic,
         cognom_canonical = excluded.cognom_canonical,
         municipi_id = excluded.municipi_id,
         arxiu_id = excluded.arxiu_id,
         llibre_id = excluded.llibre_id,
         entitat_eclesiastica_id = excluded.entitat_eclesiastica_id,
         any_acte = excluded.any_acte",
    )?
    .execute(rusqlite::params![
      encode_enum(doc.entity_type),
      doc.entity_id,
      doc.published,
      doc.label,
      doc.person_tokens_norm,
      doc.cognoms_tokens_norm,
      doc.phonetic,
      doc.cognom_canonical,
      doc.municipi_id,
      doc.arxiu_id,
      doc.llibre_id,
      doc.entitat_eclesiastica_id,
      doc.any_acte,
    ])?;
  Ok(())
}

pub(crate) fn delete_doc(conn: &Connection, object_type: ObjectType, id: i64) -> Result<()> {
  conn.execute(
    "DELETE FROM search_docs WHERE entity_type = ?1 AND entity_id = ?2",
    rusqlite::params![encode_enum(object_type), id],
  )?;
  Ok(())
}

/// Recompute (or drop) the document of one entity.
pub(crate) fn reindex_one(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
) -> Result<()> {
  match build_doc(conn, ctx, object_type, id)? {
    Some(doc) => upsert_doc(conn, &doc),
    None if INDEXED.contains(&object_type) => delete_doc(conn, object_type, id),
    None => Ok(()),
  }
}

/// Recompute every document that mentions the surname key `clau`.
pub(crate) fn reindex_carriers(conn: &Connection, ctx: &Ctx, clau: &str) -> Result<()> {
  if clau.is_empty() {
    return Ok(());
  }
  let pattern = format!("% {clau} %");
  let hits: Vec<(String, i64)> = conn
    .prepare(
      "SELECT entity_type, entity_id FROM search_docs
        WHERE ' ' || cognoms_tokens_norm || ' ' LIKE ?1
           OR ' ' || person_tokens_norm || ' ' LIKE ?1",
    )?
    .query_map([pattern], |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect::<rusqlite::Result<_>>()?;
  for (entity_type, id) in hits {
    let t: ObjectType = decode_enum(&entity_type, "object type")?;
    if t != ObjectType::Cognom {
      reindex_one(conn, ctx, t, id)?;
    }
  }
  Ok(())
}

pub(crate) fn reindex_all(conn: &Connection, ctx: &Ctx) -> Result<usize> {
  conn.execute("DELETE FROM search_docs", [])?;
  let mut written = 0;
  for t in INDEXED {
    for id in registry::all_ids(conn, t)? {
      if let Some(doc) = build_doc(conn, ctx, t, id)? {
        upsert_doc(conn, &doc)?;
        written += 1;
      }
    }
  }
  Ok(written)
}

fn doc_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, SearchDoc)> {
  Ok((
    row.get(0)?,
    SearchDoc {
      entity_type:             ObjectType::Persona,
      entity_id:               row.get(1)?,
      published:               row.get(2)?,
      label:                   row.get(3)?,
      person_tokens_norm:      row.get(4)?,
      cognoms_tokens_norm:     row.get(5)?,
      phonetic:                row.get(6)?,
      cognom_canonical:        row.get(7)?,
      municipi_id:             row.get(8)?,
      arxiu_id:                row.get(9)?,
      llibre_id:               row.get(10)?,
      entitat_eclesiastica_id: row.get(11)?,
      any_acte:                row.get(12)?,
    },
  ))
}

const DOC_COLUMNS: &str = "entity_type, entity_id, published, label, person_tokens_norm, \
  cognoms_tokens_norm, phonetic, cognom_canonical, municipi_id, arxiu_id, llibre_id, \
  entitat_eclesiastica_id, any_acte";

fn finish_doc((entity_type, mut doc): (String, SearchDoc)) -> Result<SearchDoc> {
  doc.entity_type = decode_enum(&entity_type, "object type")?;
  Ok(doc)
}

pub(crate) fn load_doc(
  conn: &Connection,
  object_type: ObjectType,
  id: i64,
) -> Result<Option<SearchDoc>> {
  let sql =
    format!("SELECT {DOC_COLUMNS} FROM search_docs WHERE entity_type = ?1 AND entity_id = ?2");
  conn
    .query_row(&sql, rusqlite::params![encode_enum(object_type), id], doc_from_row)
    .optional()?
    .map(finish_doc)
    .transpose()
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Facet-filter candidates in SQL, then score and page them in memory.
pub(crate) fn query(conn: &Connection, ctx: &Ctx, q: &SearchQuery) -> Result<SearchPage> {
  let mut sql = format!("SELECT {DOC_COLUMNS} FROM search_docs WHERE published = 1");
  let mut params: Vec<Value> = Vec::new();

  if let Some(entity) = q.entity {
    sql.push_str(" AND entity_type = ?");
    params.push(Value::Text(encode_enum(entity)));
  }
  if let (Some(level), Some(ancestor)) = (q.ancestor_type, q.ancestor_id) {
    sql.push_str(
      " AND municipi_id IN (SELECT municipi_id FROM admin_closure \
        WHERE ancestor_type = ? AND ancestor_id = ?)",
    );
    params.push(Value::Text(encode_enum(level)));
    params.push(Value::Integer(ancestor));
  }
  if let Some(entitat) = q.entitat_eclesiastica_id {
    sql.push_str(" AND entitat_eclesiastica_id = ?");
    params.push(Value::Integer(entitat));
  }
  let (from, to) = q.year_range();
  if let Some(from) = from {
    sql.push_str(" AND any_acte >= ?");
    params.push(Value::Integer(from.into()));
  }
  if let Some(to) = to {
    sql.push_str(" AND any_acte <= ?");
    params.push(Value::Integer(to.into()));
  }

  let sql = ctx.dialect.rewrite_placeholders(&sql);
  let docs = conn
    .prepare(&sql)?
    .query_map(rusqlite::params_from_iter(params.iter()), doc_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(finish_doc)
    .collect::<Result<Vec<_>>>()?;

  let plan = QueryPlan::build(&q.q, |token| {
    canonicals_for(conn, token).unwrap_or_else(|e| {
      tracing::warn!(token, error = %e, "variant lookup failed");
      Vec::new()
    })
  });
  tracing::debug!(
    q = %q.q,
    terms = plan.terms.len(),
    candidates = docs.len(),
    "search"
  );
  Ok(llinatge_core::search::rank(docs, &plan, q))
}

// ─── Trait impl ──────────────────────────────────────────────────────────────

impl Search for SqliteStore {
  async fn search<'a>(&'a self, query: &'a SearchQuery) -> Result<SearchPage> {
    let query = query.clone();
    self.read(move |conn, ctx| self::query(conn, ctx, &query)).await
  }

  async fn search_doc(&self, object_type: ObjectType, id: i64) -> Result<Option<SearchDoc>> {
    self.read(move |conn, _| load_doc(conn, object_type, id)).await
  }

  async fn reindex(&self, object_type: ObjectType, id: i64) -> Result<()> {
    self.write(move |conn, ctx| reindex_one(conn, ctx, object_type, id)).await
  }

  async fn reindex_all(&self) -> Result<usize> {
    let written = self.write(|conn, ctx| reindex_all(conn, ctx)).await?;
    tracing::info!(written, "search index rebuilt");
    Ok(written)
  }
}
