//! Synchronizer for the single-file database runtime.
//!
//! The embedded relational engine works on one database image at a time. The
//! image travels inside the string-typed file map through a latin-1 byte
//! codec; on the way in it is deserialized (falling back to treating the
//! content as bootstrap SQL text), statements from the arguments and standard
//! input run against it, and on success the image is serialized back into the
//! snapshot at the same path.

use crate::bridge::{VmRequest, VmResponse};
use crate::path;

/// A host-loaded embedded database engine.
pub trait DatabaseRuntime: Send + Sync {
    /// Open a database, optionally from a serialized image.
    ///
    /// An unreadable image is an error; the synchronizer falls back to a
    /// fresh database bootstrapped from the content as SQL text.
    fn open(&self, image: Option<&[u8]>) -> anyhow::Result<Box<dyn DatabaseHandle>>;
}

/// An open database. The native handle is released on drop.
pub trait DatabaseHandle: Send {
    /// Execute statements for their side effects only.
    fn run(&mut self, sql: &str) -> anyhow::Result<()>;
    /// Execute statements and collect result rows as stringified cells.
    fn exec(&mut self, sql: &str) -> anyhow::Result<Vec<Vec<String>>>;
    /// Serialize the database back into an image.
    fn export(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// Encode raw bytes as a string with one char per byte (U+0000..U+00FF).
pub(crate) fn bytes_to_binary_string(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

/// Decode a one-char-per-byte string back into raw bytes; chars above U+00FF
/// are truncated to their low byte.
pub(crate) fn binary_string_to_bytes(content: &str) -> Vec<u8> {
    content.chars().map(|ch| (ch as u32 & 0xff) as u8).collect()
}

struct ParsedArgs {
    database_path: Option<String>,
    sql_from_args: String,
}

/// Split runtime arguments into the database path and SQL text: `-cmd`
/// consumes the next argument as SQL, other flags are ignored, the first
/// bare argument names the database, later bare arguments are SQL.
fn parse_args(args: &[String]) -> ParsedArgs {
    let mut database_path = None;
    let mut sql_parts = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "-cmd" && i + 1 < args.len() {
            sql_parts.push(args[i + 1].clone());
            i += 2;
            continue;
        }
        if arg.starts_with('-') {
            i += 1;
            continue;
        }
        if database_path.is_none() {
            database_path = Some(if arg == ":memory:" {
                arg.clone()
            } else {
                path::normalize(arg, "/")
            });
            i += 1;
            continue;
        }
        sql_parts.push(arg.clone());
        i += 1;
    }
    ParsedArgs {
        database_path,
        sql_from_args: sql_parts.join("\n"),
    }
}

/// Run one database invocation against the request's snapshot.
pub(crate) fn run_database(
    runtime: &dyn DatabaseRuntime,
    request: &VmRequest,
) -> anyhow::Result<VmResponse> {
    let files = super::normalize_files(&request.files);
    let parsed = parse_args(&request.args);
    let db_path = parsed
        .database_path
        .as_deref()
        .filter(|p| *p != ":memory:")
        .map(str::to_string);

    let mut db = match db_path.as_ref().and_then(|p| files.get(p)) {
        Some(content) => {
            let image = binary_string_to_bytes(content);
            match runtime.open(Some(&image)) {
                Ok(db) => db,
                Err(_) => {
                    // Not a serialized image; treat the content as bootstrap
                    // SQL text for a fresh database.
                    let mut db = runtime.open(None)?;
                    if !content.trim().is_empty() {
                        let _ = db.run(content);
                    }
                    db
                }
            }
        }
        None => runtime.open(None)?,
    };

    let sql_text = [parsed.sql_from_args.as_str(), request.stdin.as_str()]
        .iter()
        .filter(|part| !part.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    let executed = if sql_text.trim().is_empty() {
        Ok(Vec::new())
    } else {
        db.exec(&sql_text)
    };

    match executed.and_then(|rows| {
        let image = match &db_path {
            Some(_) => Some(db.export()?),
            None => None,
        };
        Ok((rows, image))
    }) {
        Ok((rows, image)) => {
            let lines: Vec<String> = rows.iter().map(|row| row.join("|")).collect();
            let mut next_files = files;
            if let (Some(db_path), Some(image)) = (db_path, image) {
                next_files.insert(db_path, bytes_to_binary_string(&image));
            }
            Ok(VmResponse {
                stdout: if lines.is_empty() {
                    String::new()
                } else {
                    format!("{}\n", lines.join("\n"))
                },
                stderr: String::new(),
                exit_code: 0,
                error: None,
                files: Some(next_files),
            })
        }
        Err(error) => Ok(VmResponse {
            stdout: String::new(),
            stderr: format!("{error}\n"),
            exit_code: 1,
            error: None,
            files: Some(files),
        }),
    }
}
