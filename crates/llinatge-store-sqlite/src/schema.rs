//! SQL schema for the Llinatge SQLite store.
//!
//! Executed at connection startup. Every statement is idempotent, so running
//! it against an existing database is harmless; `RECREADB=true` runs
//! [`DROP_ALL`] first. `PRAGMA user_version` records the schema revision.

/// Full schema DDL.
pub const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

-- ── Accounts ────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS usuaris (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    usuari              TEXT NOT NULL UNIQUE,
    email               TEXT NOT NULL UNIQUE,
    password_hash       TEXT NOT NULL,       -- argon2 PHC string
    actiu               INTEGER NOT NULL DEFAULT 0,
    token_activacio     TEXT UNIQUE,
    token_expira        TEXT,
    permissions_version INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash  TEXT NOT NULL UNIQUE,        -- sha256 hex of the opaque token
    user_id     INTEGER NOT NULL REFERENCES usuaris(id),
    expires_at  TEXT NOT NULL,
    revoked     INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS grups (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    nom  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS grup_membres (
    grup_id  INTEGER NOT NULL REFERENCES grups(id),
    user_id  INTEGER NOT NULL REFERENCES usuaris(id),
    PRIMARY KEY (grup_id, user_id)
);

CREATE TABLE IF NOT EXISTS politiques (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    nom  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS politica_grants (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    politica_id       INTEGER NOT NULL REFERENCES politiques(id),
    perm_key          TEXT NOT NULL,
    scope_type        TEXT NOT NULL,         -- global | arxiu | pais | nivell_admin | comarca | municipi
    scope_id          INTEGER,
    include_children  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS usuari_politiques (
    user_id      INTEGER NOT NULL REFERENCES usuaris(id),
    politica_id  INTEGER NOT NULL REFERENCES politiques(id),
    PRIMARY KEY (user_id, politica_id)
);

CREATE TABLE IF NOT EXISTS grup_politiques (
    grup_id      INTEGER NOT NULL REFERENCES grups(id),
    politica_id  INTEGER NOT NULL REFERENCES politiques(id),
    PRIMARY KEY (grup_id, politica_id)
);

-- ── Catalogue ───────────────────────────────────────────────────────────────
-- Every publishable table carries moderation_state and the audit columns.

CREATE TABLE IF NOT EXISTS paisos (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    nom               TEXT NOT NULL,
    codi_iso          TEXT,
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS nivells_administratius (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    nom               TEXT NOT NULL,
    pais_id           INTEGER REFERENCES paisos(id),
    nivell            INTEGER,
    parent_id         INTEGER REFERENCES nivells_administratius(id),
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS municipis (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    nom               TEXT NOT NULL,
    pais_id           INTEGER REFERENCES paisos(id),
    nivell_admin_id   INTEGER REFERENCES nivells_administratius(id),
    comarca_id        INTEGER,
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS entitats_eclesiastiques (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    nom               TEXT NOT NULL,
    tipus             TEXT,                  -- arquebisbat | bisbat | parroquia ...
    parent_id         INTEGER REFERENCES entitats_eclesiastiques(id),
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS arxius (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    nom                      TEXT NOT NULL,
    municipi_id              INTEGER REFERENCES municipis(id),
    entitat_eclesiastica_id  INTEGER REFERENCES entitats_eclesiastiques(id),
    moderation_state         TEXT NOT NULL DEFAULT 'esborrany',
    created_by               INTEGER,
    updated_by               INTEGER,
    updated_at               TEXT
);

CREATE TABLE IF NOT EXISTS llibres (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    arxiu_id                 INTEGER REFERENCES arxius(id),
    titol                    TEXT NOT NULL,
    codi                     TEXT,
    municipi_id              INTEGER REFERENCES municipis(id),
    entitat_eclesiastica_id  INTEGER REFERENCES entitats_eclesiastiques(id),
    indexacio_completa       INTEGER NOT NULL DEFAULT 0,
    moderation_state         TEXT NOT NULL DEFAULT 'esborrany',
    created_by               INTEGER,
    updated_by               INTEGER,
    updated_at               TEXT
);

CREATE TABLE IF NOT EXISTS pagines (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    llibre_id         INTEGER NOT NULL REFERENCES llibres(id),
    numero            TEXT,
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS persones (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    nom               TEXT NOT NULL,
    cognom1           TEXT,
    cognom2           TEXT,
    municipi_id       INTEGER REFERENCES municipis(id),
    ofici             TEXT,
    data_naixement    TEXT,                  -- YYYY-MM-DD
    data_defuncio     TEXT,
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

-- redirect_to_id points at a canonical surname (one hop, never a chain).
CREATE TABLE IF NOT EXISTS cognoms (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    forma             TEXT NOT NULL,
    clau              TEXT NOT NULL UNIQUE,
    redirect_to_id    INTEGER REFERENCES cognoms(id),
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT,
    CHECK (redirect_to_id IS NULL OR redirect_to_id != id)
);

CREATE TABLE IF NOT EXISTS cognom_variants (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    cognom_id  INTEGER NOT NULL REFERENCES cognoms(id),
    variant    TEXT NOT NULL,
    clau       TEXT NOT NULL,
    UNIQUE (cognom_id, clau)
);

CREATE TABLE IF NOT EXISTS noms (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    forma  TEXT NOT NULL,
    clau   TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS esdeveniments (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    titol             TEXT NOT NULL,
    descripcio        TEXT,
    data              TEXT,
    any_esdeveniment  INTEGER,
    municipi_id       INTEGER REFERENCES municipis(id),
    moderation_state  TEXT NOT NULL DEFAULT 'esborrany',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

-- ── Transcriptions ──────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS transcripcions_raw (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    llibre_id         INTEGER NOT NULL REFERENCES llibres(id),
    pagina_id         INTEGER REFERENCES pagines(id),
    tipus_acte        TEXT NOT NULL,
    data_acte_text    TEXT,
    data_acte_iso     TEXT,
    any_doc           INTEGER,
    municipi_id       INTEGER REFERENCES municipis(id),
    notes             TEXT,
    import_key        TEXT,                  -- sha256 of the import dedup key
    moderation_state  TEXT NOT NULL DEFAULT 'pendent',
    created_by        INTEGER,
    updated_by        INTEGER,
    updated_at        TEXT
);

CREATE TABLE IF NOT EXISTS transcripcions_persona_raw (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    transcripcio_id  INTEGER NOT NULL REFERENCES transcripcions_raw(id),
    rol              TEXT NOT NULL,
    nom              TEXT,
    cognom1          TEXT,
    cognom2          TEXT,
    sexe             TEXT,
    edat             TEXT,
    ofici            TEXT,
    qualitat         TEXT NOT NULL DEFAULT 'clar',
    persona_id       INTEGER REFERENCES persones(id)
);

CREATE TABLE IF NOT EXISTS transcripcions_atributs_raw (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    transcripcio_id  INTEGER NOT NULL REFERENCES transcripcions_raw(id),
    clau             TEXT NOT NULL,
    tipus            TEXT NOT NULL,          -- text | num | date
    valor_text       TEXT,
    valor_num        REAL,
    valor_date       TEXT
);

-- ── Moderation ──────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS wiki_canvis (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    object_type        TEXT NOT NULL,
    object_id          INTEGER NOT NULL,     -- 0 until a create change is applied
    change_type        TEXT NOT NULL,        -- form | revert | create
    field_key          TEXT NOT NULL,
    old_value          TEXT,
    new_value          TEXT,
    metadata           TEXT NOT NULL,        -- JSON {before, after, source_change_id}
    moderation_state   TEXT NOT NULL DEFAULT 'pendent',
    changed_by         INTEGER NOT NULL,
    changed_at         TEXT NOT NULL,
    moderated_by       INTEGER,
    moderated_at       TEXT,
    moderation_reason  TEXT
);

CREATE TABLE IF NOT EXISTS wiki_marques (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    object_type  TEXT NOT NULL,
    object_id    INTEGER NOT NULL,
    user_id      INTEGER NOT NULL,
    public       INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    UNIQUE (object_type, object_id, user_id)
);

-- ── Search ──────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS admin_closure (
    municipi_id    INTEGER NOT NULL,
    ancestor_type  TEXT NOT NULL,            -- municipi | nivell_admin | pais
    ancestor_id    INTEGER NOT NULL,
    UNIQUE (municipi_id, ancestor_type, ancestor_id)
);

CREATE TABLE IF NOT EXISTS search_docs (
    entity_type              TEXT NOT NULL,
    entity_id                INTEGER NOT NULL,
    published                INTEGER NOT NULL DEFAULT 0,
    label                    TEXT NOT NULL,
    person_tokens_norm       TEXT NOT NULL DEFAULT '',
    cognoms_tokens_norm      TEXT NOT NULL DEFAULT '',
    phonetic                 TEXT NOT NULL DEFAULT '',
    cognom_canonical         TEXT,
    municipi_id              INTEGER,
    arxiu_id                 INTEGER,
    llibre_id                INTEGER,
    entitat_eclesiastica_id  INTEGER,
    any_acte                 INTEGER,
    UNIQUE (entity_type, entity_id)
);

-- ── Rollups ─────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS municipi_demografia (
    municipi_id  INTEGER NOT NULL,
    any          INTEGER NOT NULL,
    natalitat    INTEGER NOT NULL DEFAULT 0,
    matrimonis   INTEGER NOT NULL DEFAULT 0,
    defuncions   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (municipi_id, any)
);

CREATE TABLE IF NOT EXISTS municipi_demografia_meta (
    municipi_id       INTEGER PRIMARY KEY,
    any_min           INTEGER,
    any_max           INTEGER,
    total_natalitat   INTEGER NOT NULL DEFAULT 0,
    total_matrimonis  INTEGER NOT NULL DEFAULT 0,
    total_defuncions  INTEGER NOT NULL DEFAULT 0,
    lock_version      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS nivell_demografia (
    nivell_id    INTEGER NOT NULL,
    any          INTEGER NOT NULL,
    natalitat    INTEGER NOT NULL DEFAULT 0,
    matrimonis   INTEGER NOT NULL DEFAULT 0,
    defuncions   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (nivell_id, any)
);

CREATE TABLE IF NOT EXISTS nivell_demografia_meta (
    nivell_id         INTEGER PRIMARY KEY,
    any_min           INTEGER,
    any_max           INTEGER,
    total_natalitat   INTEGER NOT NULL DEFAULT 0,
    total_matrimonis  INTEGER NOT NULL DEFAULT 0,
    total_defuncions  INTEGER NOT NULL DEFAULT 0,
    lock_version      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS nom_freq (
    clau         TEXT NOT NULL,
    municipi_id  INTEGER NOT NULL,
    any          INTEGER NOT NULL,
    freq         INTEGER NOT NULL,
    PRIMARY KEY (clau, municipi_id, any)
);

CREATE TABLE IF NOT EXISTS nom_freq_total (
    clau         TEXT NOT NULL,
    municipi_id  INTEGER NOT NULL,
    total        INTEGER NOT NULL,
    PRIMARY KEY (clau, municipi_id)
);

CREATE TABLE IF NOT EXISTS cognom_freq (
    clau         TEXT NOT NULL,
    municipi_id  INTEGER NOT NULL,
    any          INTEGER NOT NULL,
    freq         INTEGER NOT NULL,
    PRIMARY KEY (clau, municipi_id, any)
);

CREATE TABLE IF NOT EXISTS cognom_freq_total (
    clau         TEXT NOT NULL,
    municipi_id  INTEGER NOT NULL,
    total        INTEGER NOT NULL,
    PRIMARY KEY (clau, municipi_id)
);

-- ── Activity, points, maps ──────────────────────────────────────────────────

-- Append-only.
CREATE TABLE IF NOT EXISTS activitat (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    action       TEXT NOT NULL,
    object_type  TEXT,
    object_id    INTEGER,
    state        TEXT NOT NULL,              -- pendent | validat | rebutjat
    points       INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS punts_usuari (
    user_id  INTEGER PRIMARY KEY,
    punts    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS punts_regles (
    action  TEXT PRIMARY KEY,
    points  INTEGER NOT NULL,
    actiu   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS municipi_mapa_versions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    municipi_id   INTEGER NOT NULL REFERENCES municipis(id),
    data          TEXT NOT NULL,
    lock_version  INTEGER NOT NULL DEFAULT 0,
    updated_by    INTEGER,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS wiki_canvis_object_idx   ON wiki_canvis(object_type, object_id, moderation_state);
CREATE INDEX IF NOT EXISTS wiki_canvis_author_idx   ON wiki_canvis(changed_by, moderation_state);
CREATE INDEX IF NOT EXISTS transcripcions_llibre_idx ON transcripcions_raw(llibre_id, tipus_acte);
CREATE INDEX IF NOT EXISTS transcripcions_key_idx   ON transcripcions_raw(import_key);
CREATE INDEX IF NOT EXISTS transcripcions_mun_idx   ON transcripcions_raw(municipi_id);
CREATE INDEX IF NOT EXISTS persona_raw_tx_idx       ON transcripcions_persona_raw(transcripcio_id);
CREATE INDEX IF NOT EXISTS atribut_raw_tx_idx       ON transcripcions_atributs_raw(transcripcio_id);
CREATE INDEX IF NOT EXISTS closure_ancestor_idx     ON admin_closure(ancestor_type, ancestor_id);
CREATE INDEX IF NOT EXISTS search_docs_filter_idx   ON search_docs(published, entity_type, municipi_id);
CREATE INDEX IF NOT EXISTS variants_clau_idx        ON cognom_variants(clau);
CREATE INDEX IF NOT EXISTS activitat_user_idx       ON activitat(user_id, created_at);

PRAGMA user_version = 1;
";

/// Default rows. `INSERT OR IGNORE` keeps reruns harmless.
pub const SEED: &str = "
INSERT OR IGNORE INTO politiques (nom) VALUES ('admin'), ('moderador'), ('editor');

INSERT OR IGNORE INTO politica_grants (id, politica_id, perm_key, scope_type, scope_id, include_children)
SELECT 1, id, 'wiki.moderate', 'global', NULL, 1 FROM politiques WHERE nom = 'moderador';
INSERT OR IGNORE INTO politica_grants (id, politica_id, perm_key, scope_type, scope_id, include_children)
SELECT 2, id, 'wiki.bypass', 'global', NULL, 1 FROM politiques WHERE nom = 'moderador';
INSERT OR IGNORE INTO politica_grants (id, politica_id, perm_key, scope_type, scope_id, include_children)
SELECT 3, id, 'wiki.edit', 'global', NULL, 1 FROM politiques WHERE nom = 'editor';

INSERT OR IGNORE INTO punts_regles (action, points) VALUES
    ('persona_approve', 5),
    ('transcripcio_approve', 2),
    ('municipi_approve', 3),
    ('llibre_approve', 3),
    ('cognom_approve', 2),
    ('esdeveniment_approve', 2);
";

/// Drops every table, children first.
pub const DROP_ALL: &str = "
PRAGMA foreign_keys = OFF;
DROP TABLE IF EXISTS municipi_mapa_versions;
DROP TABLE IF EXISTS punts_regles;
DROP TABLE IF EXISTS punts_usuari;
DROP TABLE IF EXISTS activitat;
DROP TABLE IF EXISTS cognom_freq_total;
DROP TABLE IF EXISTS cognom_freq;
DROP TABLE IF EXISTS nom_freq_total;
DROP TABLE IF EXISTS nom_freq;
DROP TABLE IF EXISTS nivell_demografia_meta;
DROP TABLE IF EXISTS nivell_demografia;
DROP TABLE IF EXISTS municipi_demografia_meta;
DROP TABLE IF EXISTS municipi_demografia;
DROP TABLE IF EXISTS search_docs;
DROP TABLE IF EXISTS admin_closure;
DROP TABLE IF EXISTS wiki_marques;
DROP TABLE IF EXISTS wiki_canvis;
DROP TABLE IF EXISTS transcripcions_atributs_raw;
DROP TABLE IF EXISTS transcripcions_persona_raw;
DROP TABLE IF EXISTS transcripcions_raw;
DROP TABLE IF EXISTS esdeveniments;
DROP TABLE IF EXISTS noms;
DROP TABLE IF EXISTS cognom_variants;
DROP TABLE IF EXISTS cognoms;
DROP TABLE IF EXISTS persones;
DROP TABLE IF EXISTS pagines;
DROP TABLE IF EXISTS llibres;
DROP TABLE IF EXISTS arxius;
DROP TABLE IF EXISTS entitats_eclesiastiques;
DROP TABLE IF EXISTS municipis;
DROP TABLE IF EXISTS nivells_administratius;
DROP TABLE IF EXISTS paisos;
DROP TABLE IF EXISTS grup_politiques;
DROP TABLE IF EXISTS usuari_politiques;
DROP TABLE IF EXISTS politica_grants;
DROP TABLE IF EXISTS politiques;
DROP TABLE IF EXISTS grup_membres;
DROP TABLE IF EXISTS grups;
DROP TABLE IF EXISTS sessions;
DROP TABLE IF EXISTS usuaris;
PRAGMA user_version = 0;
";
