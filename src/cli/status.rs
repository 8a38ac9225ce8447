use crate::db::{get_connection, get_metadata};
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::settings::{load_settings, DB_FILE_NAME};

pub fn run() -> Result<()> {
    let settings = load_settings();
    let data_dir = std::path::PathBuf::from(&settings.data_dir);
    let db_path = data_dir.join(DB_FILE_NAME);

    println!("Data dir:   {}", data_dir.display());
    println!("Database:   {}", db_path.display());
    println!("File type:  {}", settings.default_file_type);

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("DB size:    {}", format_bytes(size));

        let conn = get_connection(&db_path)?;

        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
        let profiles = count("SELECT count(*) FROM journals")?;
        let moves = count("SELECT count(*) FROM moves")?;
        let lines = count("SELECT count(*) FROM move_lines")?;
        let open = count("SELECT count(*) FROM move_lines WHERE already_completed = 0")?;

        println!();
        println!("Profiles:      {profiles}");
        println!("Moves:         {moves}");
        println!("Lines:         {lines}");
        println!("Open lines:    {open}");

        let mut stmt = conn.prepare("SELECT code FROM journals ORDER BY code")?;
        let codes: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for code in codes {
            if let Some(last) = get_metadata(&conn, &format!("last_import_date:{code}")) {
                println!("Last import ({code}): {last}");
            }
        }
    } else {
        println!();
        println!("Database not found. Run `statement-import init` to set up.");
    }

    Ok(())
}
