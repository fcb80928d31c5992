use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

use super::watch::{ChangeKind, LiveQuery, Table};
use super::{bool_column, json_column, now_ms, to_json, StorageHandle};
use crate::model::{Category, Note};
use crate::search::SearchQuery;

const TAG_DELIMITER: &str = "|:|";
const FTS_ROW_LIMIT: usize = 200;
const BM25_TITLE_WEIGHT: f64 = 0.2;
const BM25_BODY_WEIGHT: f64 = 1.0;

fn note_select(tail: &str) -> String {
    format!(
        "SELECT n.id,
                n.title,
                n.content,
                n.is_checklist,
                n.checklist_items,
                n.category,
                n.color_hex,
                n.is_pinned,
                n.is_favorite,
                n.created_at,
                n.updated_at,
                COALESCE((
                    SELECT GROUP_CONCAT(t.name, '{delim}')
                    FROM note_tags nt
                    INNER JOIN tags t ON t.id = nt.tag_id
                    WHERE nt.note_id = n.id
                ), '')
         FROM notes n
         {tail}",
        delim = TAG_DELIMITER
    )
}

impl StorageHandle {
    pub fn fetch_note(&self, note_id: i64) -> Result<Option<Note>> {
        self.with_connection(|conn| {
            conn.query_row(&note_select("WHERE n.id = ?1"), params![note_id], note_from_row)
                .optional()
                .with_context(|| format!("loading note {note_id}"))
        })
    }

    /// Pinned notes first, then most recently updated.
    pub fn fetch_all_notes(&self) -> Result<Vec<Note>> {
        self.with_connection(|conn| {
            query_notes(conn, "ORDER BY n.is_pinned DESC, n.updated_at DESC", [])
        })
    }

    pub fn fetch_notes_by_category(&self, category: Category) -> Result<Vec<Note>> {
        self.with_connection(|conn| {
            query_notes(
                conn,
                "WHERE n.category = ?1 ORDER BY n.is_pinned DESC, n.updated_at DESC",
                params![category.to_string()],
            )
        })
    }

    pub fn fetch_pinned_notes(&self) -> Result<Vec<Note>> {
        self.with_connection(|conn| {
            query_notes(conn, "WHERE n.is_pinned = 1 ORDER BY n.updated_at DESC", [])
        })
    }

    pub fn fetch_favorite_notes(&self) -> Result<Vec<Note>> {
        self.with_connection(|conn| {
            query_notes(
                conn,
                "WHERE n.is_favorite = 1 ORDER BY n.is_pinned DESC, n.updated_at DESC",
                [],
            )
        })
    }

    fn fetch_notes_batch(&self, limit: usize, offset: usize) -> Result<Vec<Note>> {
        self.with_connection(|conn| {
            query_notes(
                conn,
                "ORDER BY n.is_pinned DESC, n.updated_at DESC LIMIT ?1 OFFSET ?2",
                params![limit as i64, offset as i64],
            )
        })
    }

    pub fn search_notes(&self, query: &SearchQuery, limit: usize) -> Result<Vec<Note>> {
        if query.is_empty() {
            return self.fetch_notes_batch(limit, 0);
        }

        let regex = query
            .regex_pattern
            .as_deref()
            .map(compile_pattern)
            .transpose()?;

        if !query.has_terms() {
            if let Some(regex) = regex {
                return self.search_regex_only(query, limit, regex);
            }
        }

        let fetch_limit = limit.max(FTS_ROW_LIMIT);
        let mut notes = if query.has_terms() {
            self.search_with_terms(query, fetch_limit)?
        } else {
            self.fetch_notes_batch(fetch_limit, 0)?
        };

        apply_filters(&mut notes, query);
        if let Some(regex) = &regex {
            notes.retain(|note| regex.is_match(&note.title) || regex.is_match(&note.content));
        }
        notes.truncate(limit);
        Ok(notes)
    }

    fn search_with_terms(&self, query: &SearchQuery, limit: usize) -> Result<Vec<Note>> {
        let Some(match_expr) = build_match_expression(query) else {
            return Ok(Vec::new());
        };
        let title_priority_tokens = query
            .highlight_terms()
            .into_iter()
            .map(|token| token.to_lowercase())
            .collect::<Vec<_>>();
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT n.id,
                        n.title,
                        n.content,
                        n.is_checklist,
                        n.checklist_items,
                        n.category,
                        n.color_hex,
                        n.is_pinned,
                        n.is_favorite,
                        n.created_at,
                        n.updated_at,
                        COALESCE((
                            SELECT GROUP_CONCAT(t.name, '{delim}')
                            FROM note_tags nt
                            INNER JOIN tags t ON t.id = nt.tag_id
                            WHERE nt.note_id = n.id
                        ), ''),
                        snippet(fts_notes, -1, '', '', ' ... ', 20)
                 FROM fts_notes
                 INNER JOIN notes n ON n.id = fts_notes.rowid
                 WHERE fts_notes MATCH ?1
                 ORDER BY n.is_pinned DESC,
                          bm25(fts_notes, {title_weight}, {body_weight}),
                          n.updated_at DESC
                 LIMIT ?2",
                delim = TAG_DELIMITER,
                title_weight = BM25_TITLE_WEIGHT,
                body_weight = BM25_BODY_WEIGHT
            );
            let mut stmt = conn.prepare(&sql)?;
            let notes = stmt
                .query_map(params![match_expr, limit as i64], |row| {
                    let mut note = note_from_row(row)?;
                    let snippet: String = row.get(12)?;
                    let snippet = snippet.trim();
                    if !snippet.is_empty() {
                        note.snippet = Some(snippet.to_string());
                    }
                    Ok(note)
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("querying search results")?;
            Ok(prioritize_title_matches(notes, &title_priority_tokens))
        })
    }

    fn search_regex_only(&self, query: &SearchQuery, limit: usize, regex: Regex) -> Result<Vec<Note>> {
        let mut results = Vec::new();
        let mut offset = 0usize;
        let batch_size = limit.max(FTS_ROW_LIMIT);
        loop {
            let mut batch = self.fetch_notes_batch(batch_size, offset)?;
            if batch.is_empty() {
                break;
            }
            apply_filters(&mut batch, query);
            batch.retain(|note| regex.is_match(&note.title) || regex.is_match(&note.content));
            results.extend(batch);
            if results.len() >= limit {
                break;
            }
            offset += batch_size;
        }
        results.truncate(limit);
        Ok(results)
    }

    /// Inserts `note` with its tags in one transaction and returns the new id.
    pub fn insert_note(&self, note: &Note) -> Result<i64> {
        let title = note.title.trim();
        if title.is_empty() {
            bail!("note title cannot be empty");
        }
        let now = now_ms();
        let id = self.with_connection(|conn| {
            let tx = conn.unchecked_transaction().context("starting note insert")?;
            tx.execute(
                "INSERT INTO notes (title, content, is_checklist, checklist_items, category,
                                    color_hex, is_pinned, is_favorite, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    title,
                    note.content,
                    note.is_checklist,
                    to_json(&note.checklist_items)?,
                    note.category.map(|category| category.to_string()),
                    note.color_hex,
                    note.is_pinned,
                    note.is_favorite,
                    now,
                ],
            )
            .context("inserting note")?;
            let id = tx.last_insert_rowid();
            for tag in &note.tags {
                link_tag(&tx, id, tag)?;
            }
            tx.commit().context("committing note insert")?;
            Ok(id)
        })?;
        self.publish(Table::Notes, id, ChangeKind::Inserted);
        Ok(id)
    }

    /// Rewrites the note's fields and replaces its tag set.
    pub fn update_note(&self, note: &Note) -> Result<()> {
        let title = note.title.trim();
        if title.is_empty() {
            bail!("note title cannot be empty");
        }
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction().context("starting note update")?;
            let updated = tx
                .execute(
                    "UPDATE notes SET title = ?2, content = ?3, is_checklist = ?4,
                            checklist_items = ?5, category = ?6, color_hex = ?7,
                            is_pinned = ?8, is_favorite = ?9, updated_at = ?10
                     WHERE id = ?1",
                    params![
                        note.id,
                        title,
                        note.content,
                        note.is_checklist,
                        to_json(&note.checklist_items)?,
                        note.category.map(|category| category.to_string()),
                        note.color_hex,
                        note.is_pinned,
                        note.is_favorite,
                        now_ms(),
                    ],
                )
                .context("updating note")?;
            if updated == 0 {
                bail!("note {} not found", note.id);
            }
            tx.execute("DELETE FROM note_tags WHERE note_id = ?1", params![note.id])
                .context("clearing note tags")?;
            for tag in &note.tags {
                link_tag(&tx, note.id, tag)?;
            }
            tx.commit().context("committing note update")?;
            Ok(())
        })?;
        self.publish(Table::Notes, note.id, ChangeKind::Updated);
        Ok(())
    }

    pub fn delete_note(&self, note_id: i64) -> Result<bool> {
        let removed = self.with_connection(|conn| {
            conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id])
                .context("deleting note")
        })?;
        if removed > 0 {
            self.publish(Table::Notes, note_id, ChangeKind::Deleted);
        }
        Ok(removed > 0)
    }

    pub fn set_note_pinned(&self, note_id: i64, pinned: bool) -> Result<()> {
        self.set_note_flag(note_id, "is_pinned", pinned)
    }

    pub fn set_note_favorite(&self, note_id: i64, favorite: bool) -> Result<()> {
        self.set_note_flag(note_id, "is_favorite", favorite)
    }

    fn set_note_flag(&self, note_id: i64, column: &str, value: bool) -> Result<()> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    &format!("UPDATE notes SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
                    params![value, now_ms(), note_id],
                )
                .with_context(|| format!("updating note {column}"))?;
            if updated == 0 {
                bail!("note {note_id} not found");
            }
            Ok(())
        })?;
        self.publish(Table::Notes, note_id, ChangeKind::Updated);
        Ok(())
    }

    pub fn add_tag_to_note(&self, note_id: i64, tag_name: &str) -> Result<()> {
        self.with_connection(|conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM notes WHERE id = ?1", params![note_id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                bail!("note {note_id} not found");
            }
            link_tag(conn, note_id, tag_name)
        })?;
        self.publish(Table::Notes, note_id, ChangeKind::Updated);
        Ok(())
    }

    pub fn remove_tag_from_note(&self, note_id: i64, tag_name: &str) -> Result<()> {
        let tag = tag_name.trim();
        if tag.is_empty() {
            bail!("tag name cannot be empty");
        }
        self.with_connection(|conn| {
            let affected = conn.execute(
                "DELETE FROM note_tags
                 WHERE note_id = ?1
                   AND tag_id = (SELECT id FROM tags WHERE name = ?2)",
                params![note_id, tag],
            )?;
            if affected == 0 {
                bail!("tag '{tag}' not associated with note {note_id}");
            }
            Ok(())
        })?;
        self.publish(Table::Notes, note_id, ChangeKind::Updated);
        Ok(())
    }

    pub fn list_all_tags(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM tags ORDER BY name COLLATE NOCASE")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("fetching all tags")
        })
    }

    pub fn watch_all_notes(&self) -> Result<LiveQuery<Note>> {
        let storage = self.clone();
        LiveQuery::start(
            Table::Notes,
            self.changes().subscribe(),
            Box::new(move || storage.fetch_all_notes()),
        )
    }
}

fn link_tag(conn: &Connection, note_id: i64, tag_name: &str) -> Result<()> {
    let tag = tag_name.trim();
    if tag.is_empty() {
        bail!("tag name cannot be empty");
    }
    let tag_id = match conn
        .query_row("SELECT id FROM tags WHERE name = ?1", params![tag], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?
    {
        Some(id) => id,
        None => {
            conn.execute("INSERT INTO tags (name) VALUES (?1)", params![tag])
                .context("inserting tag")?;
            conn.last_insert_rowid()
        }
    };
    conn.execute(
        "INSERT OR IGNORE INTO note_tags (note_id, tag_id) VALUES (?1, ?2)",
        params![note_id, tag_id],
    )
    .context("linking tag to note")?;
    Ok(())
}

fn query_notes<P: Params>(conn: &Connection, tail: &str, params: P) -> Result<Vec<Note>> {
    let mut stmt = conn.prepare(&note_select(tail)).context("preparing note query")?;
    let notes = stmt
        .query_map(params, note_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("querying notes")?;
    Ok(notes)
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let category: Option<String> = row.get(5)?;
    let tags: String = row.get(11)?;
    Ok(Note {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        is_checklist: bool_column(row, 3)?,
        checklist_items: json_column(row, 4)?,
        category: category.and_then(|raw| raw.parse().ok()),
        color_hex: row.get(6)?,
        is_pinned: bool_column(row, 7)?,
        is_favorite: bool_column(row, 8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        tags: parse_tags(&tags),
        snippet: None,
    })
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .context("compiling regex search pattern")
}

fn build_match_expression(query: &SearchQuery) -> Option<String> {
    let clauses: Vec<String> = [
        build_clause(None, &query.terms),
        build_clause(Some("title"), &query.title_terms),
    ]
    .into_iter()
    .flatten()
    .collect();
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn build_clause(column: Option<&str>, terms: &[String]) -> Option<String> {
    let mut parts = Vec::new();
    for term in terms {
        let trimmed = term.trim();
        if trimmed.is_empty() {
            continue;
        }
        let escaped = trimmed.replace('"', "\"\"");
        let has_whitespace = trimmed.chars().any(|ch| ch.is_whitespace());
        let fragment = match (column, has_whitespace) {
            (Some(col), true) => format!("{col}:\"{escaped}\""),
            (None, true) => format!("\"{escaped}\""),
            // Quoting keeps `-`, `.` and `/` from reaching the FTS5 parser.
            (Some(col), false) => format!("{col}:\"{escaped}\"*"),
            (None, false) => format!("\"{escaped}\"*"),
        };
        parts.push(fragment);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(TAG_DELIMITER)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn prioritize_title_matches(notes: Vec<Note>, tokens: &[String]) -> Vec<Note> {
    if tokens.is_empty() {
        return notes;
    }
    let (mut with_title, without_title): (Vec<Note>, Vec<Note>) = notes
        .into_iter()
        .partition(|note| title_contains_any(&note.title, tokens));
    with_title.extend(without_title);
    with_title
}

fn title_contains_any(title: &str, tokens: &[String]) -> bool {
    let haystack = title.to_lowercase();
    tokens
        .iter()
        .any(|token| !token.is_empty() && haystack.contains(token.as_str()))
}

fn apply_filters(notes: &mut Vec<Note>, query: &SearchQuery) {
    if !query.has_filters() {
        return;
    }
    let wanted: Vec<String> = query.tags.iter().map(|tag| tag.to_lowercase()).collect();
    notes.retain(|note| {
        if !wanted.is_empty() {
            let note_tags: HashSet<String> =
                note.tags.iter().map(|tag| tag.to_lowercase()).collect();
            if !wanted.iter().all(|tag| note_tags.contains(tag)) {
                return false;
            }
        }
        query.created.contains(note.created_at) && query.updated.contains(note.updated_at)
    });
}
