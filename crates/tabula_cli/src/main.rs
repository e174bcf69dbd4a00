use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tabula_core::{
    schema::generate_tag, BatchMode, Column, Ctx, Database, Encoding, EngineConfig, FileChunkStore, Row, Schema,
    Table, Value, WriteMode,
};

#[derive(Parser)]
#[command(name = "tabula", about = "tabula CLI: inspect and edit a versioned table store")]
struct Cli {
    /// Engine config (JSON). Defaults to <dir>/tabula.json when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    Init {
        #[arg(long)]
        dir: PathBuf,
    },

    Table {
        #[command(subcommand)]
        cmd: TableCmd,
    },

    Row {
        #[command(subcommand)]
        cmd: RowCmd,
    },

    /// Head root, segments and tables.
    Info {
        #[arg(long)]
        dir: PathBuf,
    },

    /// Check segment records and that every chunk the head reaches exists.
    Verify {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum TableCmd {
    Create {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        name: String,
        /// name:sql_type[:flags], flags joined by '+': pk, auto, notnull
        #[arg(long = "column", required = true)]
        columns: Vec<String>,
    },
    List {
        #[arg(long)]
        dir: PathBuf,
    },
    Drop {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum RowCmd {
    Insert {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
        /// One value per column; NULL for null.
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },
    Get {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
        /// Primary-key values in key order.
        #[arg(required = true, num_args = 1..)]
        key: Vec<String>,
    },
    Delete {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(required = true, num_args = 1..)]
        key: Vec<String>,
    },
    Scan {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
        /// One JSON array per row.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Count {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        table: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TABULA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_db(dir: &Path, config: Option<&Path>) -> Result<(Arc<FileChunkStore>, Database)> {
    let cfg_path = config.map(Path::to_path_buf).unwrap_or_else(|| dir.join("tabula.json"));
    let cfg = EngineConfig::load(&cfg_path).with_context(|| format!("loading {}", cfg_path.display()))?;
    let store = Arc::new(FileChunkStore::open(dir)?);
    let db = Database::open(store.clone(), &cfg)?;
    Ok((store, db))
}

fn parse_column(table: &str, spec: &str, taken: &mut HashSet<u64>) -> Result<Column> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| anyhow!("column spec {spec:?} has no name"))?;
    let sql_type = parts.next().ok_or_else(|| anyhow!("column {name} has no type"))?;
    let tag = generate_tag(table, name, sql_type, taken);
    taken.insert(tag);
    let mut col = Column::new(name, tag, Encoding::from_sql_type(sql_type)?).with_sql_type(sql_type);
    for flag in parts.next().unwrap_or("").split('+').filter(|f| !f.is_empty()) {
        col = match flag {
            "pk" => col.primary_key(),
            "auto" => col.auto_increment(),
            "notnull" => col.not_null(),
            other => bail!("unknown column flag {other:?}"),
        };
    }
    Ok(col)
}

fn parse_row(schema: &Schema, values: &[String]) -> Result<Row> {
    if values.len() != schema.columns().len() {
        bail!("expected {} values, got {}", schema.columns().len(), values.len());
    }
    Ok(schema
        .columns()
        .iter()
        .zip(values)
        .map(|(c, v)| c.encoding.parse(v))
        .collect::<tabula_core::Result<_>>()?)
}

fn parse_key(schema: &Schema, values: &[String]) -> Result<Vec<Value>> {
    let pk = schema.pk_positions();
    if values.len() != pk.len() {
        bail!("expected {} key values, got {}", pk.len(), values.len());
    }
    Ok(pk
        .iter()
        .zip(values)
        .map(|(&p, v)| schema.columns()[p as usize].encoding.parse(v))
        .collect::<tabula_core::Result<_>>()?)
}

fn load_table(db: &Database, ctx: &Ctx, name: &str) -> Result<Table> {
    db.root(ctx)?.get_table(ctx, name)?.ok_or_else(|| anyhow!("no table named {name}"))
}

fn render_row(row: &[Value]) -> String {
    row.iter().map(Value::to_string).collect::<Vec<_>>().join(",")
}

fn json_row(row: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(
        row.iter()
            .map(|v| match v {
                Value::Null => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::from(*b),
                Value::Int(i) => serde_json::Value::from(*i),
                Value::Uint(u) => serde_json::Value::from(*u),
                Value::Float(f) => serde_json::Value::from(*f),
                Value::Text(s) => serde_json::Value::from(s.as_str()),
                other => serde_json::Value::from(other.to_string()),
            })
            .collect(),
    )
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Ctx::new();
    let config = cli.config.as_deref();
    match cli.cmd {
        Cmd::Init { dir } => {
            let (store, _db) = open_db(&dir, config)?;
            store.manifest().save_atomic(&dir)?;
            println!("init: {}", dir.display());
        }

        Cmd::Table { cmd } => match cmd {
            TableCmd::Create { dir, name, columns } => {
                let (_store, db) = open_db(&dir, config)?;
                let mut taken = HashSet::new();
                let cols = columns
                    .iter()
                    .map(|c| parse_column(&name, c, &mut taken))
                    .collect::<Result<Vec<_>>>()?;
                let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched)?;
                s.create_table(&ctx, &name, Schema::new(cols)?)?;
                let head = s.commit(&ctx, &db)?;
                debug!(head = %head, "committed");
                println!("table created: {name}");
            }
            TableCmd::List { dir } => {
                let (_store, db) = open_db(&dir, config)?;
                let root = db.root(&ctx)?;
                for name in root.table_names(&ctx)? {
                    let t = load_table(&db, &ctx, &name)?;
                    println!("{name}\trows={}", t.count());
                }
            }
            TableCmd::Drop { dir, name } => {
                let (_store, db) = open_db(&dir, config)?;
                let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched)?;
                s.drop_table(&ctx, &name)?;
                s.commit(&ctx, &db)?;
                println!("table dropped: {name}");
            }
        },

        Cmd::Row { cmd } => match cmd {
            RowCmd::Insert { dir, table, values } => {
                let (_store, db) = open_db(&dir, config)?;
                let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched)?;
                let row = parse_row(s.table(&ctx, &table)?.schema(), &values)?;
                let stored = s.insert(&ctx, &table, row)?;
                s.commit(&ctx, &db)?;
                println!("inserted: {}", render_row(&stored));
            }
            RowCmd::Get { dir, table, key } => {
                let (_store, db) = open_db(&dir, config)?;
                let t = load_table(&db, &ctx, &table)?;
                let key = parse_key(t.schema(), &key)?;
                match t.get_row(&ctx, &key)? {
                    Some(row) => println!("{}", render_row(&row)),
                    None => bail!("no row with key {}", render_row(&key)),
                }
            }
            RowCmd::Delete { dir, table, key } => {
                let (_store, db) = open_db(&dir, config)?;
                let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched)?;
                let key = parse_key(s.table(&ctx, &table)?.schema(), &key)?;
                let removed = s.delete(&ctx, &table, &key)?;
                s.commit(&ctx, &db)?;
                println!("deleted: {}", if removed { 1 } else { 0 });
            }
            RowCmd::Scan { dir, table, json } => {
                let (_store, db) = open_db(&dir, config)?;
                let t = load_table(&db, &ctx, &table)?;
                for row in t.scan(&ctx)? {
                    let row = row?;
                    if json {
                        println!("{}", json_row(&row));
                    } else {
                        println!("{}", render_row(&row));
                    }
                }
            }
            RowCmd::Count { dir, table } => {
                let (_store, db) = open_db(&dir, config)?;
                println!("{}", load_table(&db, &ctx, &table)?.count());
            }
        },

        Cmd::Info { dir } => {
            let (store, db) = open_db(&dir, config)?;
            let m = store.manifest();
            println!("head     : {}", db.head()?);
            println!("segments : {} ({} chunks)", m.segments.len(), m.total_chunks());
            let root = db.root(&ctx)?;
            println!("tables   : {}", root.table_count());
            for name in root.table_names(&ctx)? {
                let t = load_table(&db, &ctx, &name)?;
                let indexes = t.index_names(&ctx)?;
                println!("  {name} rows={} indexes=[{}]", t.count(), indexes.join(","));
            }
        }

        Cmd::Verify { dir } => {
            let (store, db) = open_db(&dir, config)?;
            let (ok, bad) = store.verify()?;
            let mut reachable = 0usize;
            let mut missing = 0usize;
            db.root(&ctx)?.walk_addresses(&ctx, |a| {
                reachable += 1;
                if !db.chunk_store().has(a)? {
                    missing += 1;
                }
                Ok(())
            })?;
            println!("verify: records ok={ok} bad={bad}");
            println!("        reachable={reachable} missing={missing}");
            if bad > 0 || missing > 0 {
                bail!("store is damaged");
            }
        }
    }
    Ok(())
}
