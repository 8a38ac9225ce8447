use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::builder::MoveBuilder;
use crate::completion::RuleRegistry;
use crate::db::set_metadata;
use crate::error::{ImportError, Result};
use crate::models::{ImportProfile, Move};
use crate::parser::{new_move_parser, FileType, RowGroup};
use crate::store::MoveStore;

/// Move reference derived from an uploaded file name: the name without
/// its directory and last extension.
pub fn move_ref_from_file_name(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Import every statement found in `data`. The statements share one
/// transaction: either all their moves are committed or none is.
pub fn multi_move_import<S: MoveStore>(
    conn: &mut Connection,
    profile: &ImportProfile,
    registry: &RuleRegistry,
    store: &S,
    data: &[u8],
    ftype: FileType,
    file_name: Option<&str>,
) -> Result<Vec<Move>> {
    let move_ref = file_name.and_then(move_ref_from_file_name);
    let mut parser = new_move_parser(profile, ftype, move_ref.as_deref());
    let groups = parser.parse(data)?;
    info!(profile = %profile.name, statements = groups.len(), "Parsed statement file");

    let builder = MoveBuilder::new(profile, registry, store);
    import_groups(conn, profile, &builder, &groups, data, parser.file_type())
}

fn import_groups<S: MoveStore>(
    conn: &mut Connection,
    profile: &ImportProfile,
    builder: &MoveBuilder<'_, S>,
    groups: &[RowGroup],
    data: &[u8],
    ftype: FileType,
) -> Result<Vec<Move>> {
    let mut tx = conn.transaction()?;
    let mut moves = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let mv = builder.build_in(&mut tx, group, data, ftype)?;
        info!(
            statement = index + 1,
            move_name = %mv.name,
            rows = group.result_row_list.len(),
            "Statement imported"
        );
        moves.push(mv);
    }
    set_metadata(
        &tx,
        &format!("last_import_date:{}", profile.code),
        &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    )?;
    tx.commit()?;
    info!(profile = %profile.name, moves = moves.len(), "Import committed");
    Ok(moves)
}

/// Read a statement file from disk and import it. The file type defaults
/// to the file's extension.
pub fn import_file<S: MoveStore>(
    conn: &mut Connection,
    profile: &ImportProfile,
    registry: &RuleRegistry,
    store: &S,
    path: &Path,
    ftype: Option<FileType>,
) -> Result<Vec<Move>> {
    let ftype = match ftype {
        Some(t) => t,
        None => {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            FileType::from_key(ext)?
        }
    };
    if !path.exists() {
        return Err(ImportError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("File not found: {}", path.display()),
        )));
    }
    let data = std::fs::read(path)?;
    let file_name = path.file_name().and_then(|n| n.to_str());
    multi_move_import(conn, profile, registry, store, &data, ftype, file_name)
}
