//! Merging an incoming row into an existing transcription of an indexed book.

use llinatge_core::{
  entity::{Transcripcio, TranscripcioAtribut, TranscripcioPersona},
  search::normalize,
};

use crate::template::MergePolicy;

/// The first person whose role is one of `roles` (case-insensitive).
pub fn principal<'a>(t: &'a Transcripcio, roles: &[String]) -> Option<&'a TranscripcioPersona> {
  roles
    .iter()
    .find_map(|r| t.persones.iter().find(|p| p.rol.eq_ignore_ascii_case(r)))
}

fn norm(v: &Option<String>) -> Option<String> {
  v.as_deref().map(normalize).filter(|s| !s.is_empty())
}

/// Two occurrences name the same person when the normalised `nom` and
/// `cognom1` agree, and `cognom2` agrees whenever both sides carry it.
pub fn same_person(a: &TranscripcioPersona, b: &TranscripcioPersona) -> bool {
  let (Some(nom_a), Some(nom_b)) = (norm(&a.nom), norm(&b.nom)) else { return false };
  if nom_a != nom_b || norm(&a.cognom1) != norm(&b.cognom1) {
    return false;
  }
  match (norm(&a.cognom2), norm(&b.cognom2)) {
    (Some(x), Some(y)) => x == y,
    _ => true,
  }
}

/// Whether `incoming` should merge into `existing` under `policy`.
pub fn matches(existing: &Transcripcio, incoming: &Transcripcio, policy: &MergePolicy) -> bool {
  if existing.llibre_id != incoming.llibre_id
    || !existing.tipus_acte.eq_ignore_ascii_case(&incoming.tipus_acte)
  {
    return false;
  }
  match (
    principal(existing, &policy.principal_roles),
    principal(incoming, &policy.principal_roles),
  ) {
    (Some(a), Some(b)) => a.rol.eq_ignore_ascii_case(&b.rol) && same_person(a, b),
    _ => false,
  }
}

/// What a merge changes on the existing row.
#[derive(Debug, Clone)]
pub struct Merged {
  /// The existing row with its base fields updated.
  pub transcripcio: Transcripcio,
  pub new_people:   Vec<TranscripcioPersona>,
  pub new_attrs:    Vec<TranscripcioAtribut>,
  pub changed:      bool,
}

fn take<T: Clone + PartialEq>(dst: &mut Option<T>, src: &Option<T>, missing_only: bool) -> bool {
  let Some(v) = src else { return false };
  if (missing_only && dst.is_some()) || dst.as_ref() == Some(v) {
    return false;
  }
  *dst = Some(v.clone());
  true
}

pub fn merge(existing: &Transcripcio, incoming: &Transcripcio, policy: &MergePolicy) -> Merged {
  let only = policy.update_missing_only;
  let mut t = existing.clone();
  let mut changed = false;
  changed |= take(&mut t.pagina_id, &incoming.pagina_id, only);
  changed |= take(&mut t.data_acte_text, &incoming.data_acte_text, only);
  changed |= take(&mut t.data_acte_iso, &incoming.data_acte_iso, only);
  changed |= take(&mut t.any_doc, &incoming.any_doc, only);
  changed |= take(&mut t.municipi_id, &incoming.municipi_id, only);
  changed |= take(&mut t.notes, &incoming.notes, only);

  let new_people: Vec<_> = if policy.add_missing_people {
    incoming
      .persones
      .iter()
      .filter(|p| {
        !existing
          .persones
          .iter()
          .any(|e| e.rol.eq_ignore_ascii_case(&p.rol) && (same_person(e, p) || e.nom.is_none()))
      })
      .cloned()
      .collect()
  } else {
    Vec::new()
  };

  let new_attrs: Vec<_> = if policy.add_missing_attrs {
    incoming
      .atributs
      .iter()
      .filter(|a| !existing.atributs.iter().any(|e| e.clau == a.clau))
      .cloned()
      .collect()
  } else {
    Vec::new()
  };

  changed |= !new_people.is_empty() || !new_attrs.is_empty();
  t.persones.extend(new_people.iter().cloned());
  t.atributs.extend(new_attrs.iter().cloned());
  Merged { transcripcio: t, new_people, new_attrs, changed }
}
