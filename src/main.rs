use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use hybrag::{
    cli::{Cli, Command, ConfigAction, IndexArgs, SearchArgs, StatusArgs},
    config::{self, SETTING_KEYS, Settings},
    config_db::ConfigDb,
    data_dir::DataDir,
    dense::EmbeddingRecord,
    embedding::{self, build_embedder},
    error::{Error, FailureClass, Result},
    generation::{build_prompt, format_context},
    index::{IndexHandle, RetrievalIndex},
    pipeline::QueryPipeline,
    registry::load_chunks,
    search,
    store,
};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("HYBRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn exit_code(class: FailureClass) -> u8 {
    match class {
        FailureClass::System => 1,
        FailureClass::Caller => 2,
        FailureClass::Unavailable => 3,
        FailureClass::Integrity => 4,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(exit_code(err.class()))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    debug!(data_dir = %data_dir.root().display(), "data directory resolved");

    match cli.command {
        Command::Index(args) => {
            cmd_index(&config_db, &data_dir, &args, !cli.quiet)?;
        }
        Command::Search(args) => {
            cmd_search(&config_db, &data_dir, &args)?;
        }
        Command::Status(args) => {
            cmd_status(&config_db, &data_dir, &args)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Show { json } => config_show(&config_db, json)?,
            ConfigAction::Set { key, value } => {
                config::set_setting(&config_db, &key, &value)?;
                println!("Set {key} = {}", value.trim());
            }
            ConfigAction::Clear { key } => config_clear(&config_db, &key)?,
        },
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_index(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    args: &IndexArgs,
    show_progress: bool,
) -> Result<()> {
    let settings = Settings::load(config_db)?;
    let policy = args.tokenizer.unwrap_or(settings.tokenizer);
    let descriptor = args.embedder.clone().unwrap_or(settings.embedder);

    let chunks = load_chunks(&args.chunks)?;
    eprintln!("Loaded {} chunks from {}", chunks.len(), args.chunks.display());

    let records: Vec<EmbeddingRecord> = match &args.embeddings {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        }
        None => {
            let embedder = build_embedder(&descriptor)?;
            embedding::embed_chunks(
                embedder.as_ref(),
                &chunks,
                args.batch_size,
                show_progress,
            )?
        }
    };

    let handle = IndexHandle::new();
    handle.rebuild(|| {
        RetrievalIndex::build(chunks, records, policy, settings.retrieval.bm25)
            .map(|index| index.with_embedder(descriptor.clone()))
    })?;
    let index = handle.snapshot()?;
    let generation = store::save(&index, &data_dir.index_dir()?)?;

    eprintln!(
        "Indexed {} chunks (generation {generation}, tokenizer {policy}, \
         embedder {descriptor})",
        index.len()
    );
    Ok(())
}

fn cmd_search(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    args: &SearchArgs,
) -> Result<()> {
    let settings = Settings::load(config_db)?;
    let config = args.retrieval_config(settings.retrieval)?;
    if args.query.trim().is_empty() {
        return Err(Error::EmptyQuery);
    }

    let index = store::load(&data_dir.index_dir()?, config.bm25)?;
    let descriptor = index
        .embedder()
        .cloned()
        .unwrap_or_else(|| settings.embedder.clone());
    let embedder = Arc::from(build_embedder(&descriptor)?);
    let pipeline = QueryPipeline::new(
        Arc::new(IndexHandle::with_index(index)),
        embedder,
        config,
    )?;

    if args.detailed {
        let trace = pipeline.execute_detailed(&args.query)?;
        if args.json {
            println!("{}", search::format_detailed_json(&trace)?);
        } else {
            print!("{}", search::format_detailed(&trace));
        }
        return Ok(());
    }

    let passages = pipeline.execute(&args.query)?;
    if args.prompt {
        let prompt = build_prompt(args.query.trim(), &format_context(&passages));
        if args.json {
            let value = json!({
                "query": args.query.trim(),
                "prompt": prompt,
                "results": passages,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{prompt}");
        }
    } else if args.json {
        println!("{}", search::format_json(args.query.trim(), &passages)?);
    } else {
        print!("{}", search::format_human(&passages));
    }
    Ok(())
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    args: &StatusArgs,
) -> Result<()> {
    let settings = Settings::load(config_db)?;
    let index_dir = data_dir.index_dir()?;
    let generation = store::current_generation(&index_dir)?;
    let index = match generation {
        Some(_) => Some(store::load(&index_dir, settings.retrieval.bm25)?),
        None => None,
    };

    if args.json {
        let index_json = index.as_ref().map(|index| {
            json!({
                "generation": generation,
                "chunks": index.len(),
                "dimension": index.dense().dimension().ok(),
                "terms": index.sparse().postings().map(|p| p.len()).ok(),
                "tokenizer": index.sparse().tokenizer().policy(),
                "embedder": index.embedder().map(ToString::to_string),
            })
        });
        let value = json!({
            "data_dir": data_dir.root().display().to_string(),
            "index": index_json,
            "settings": settings,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    match (&index, generation) {
        (Some(index), Some(generation)) => {
            println!("Index: generation {generation}");
            println!("  Chunks: {}", index.len());
            println!("  Dimension: {}", index.dense().dimension()?);
            println!("  Terms: {}", index.sparse().postings()?.len());
            println!("  Tokenizer: {}", index.sparse().tokenizer().policy());
            if let Some(embedder) = index.embedder() {
                println!("  Embedder: {embedder}");
            }
        }
        _ => println!("Index: not built"),
    }
    println!("Settings:");
    for key in SETTING_KEYS {
        if let Some(value) = settings.get(key) {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

fn config_show(config_db: &ConfigDb, json: bool) -> Result<()> {
    let settings = Settings::load(config_db)?;
    let stored: Vec<String> = config_db
        .list_settings()?
        .into_iter()
        .map(|(k, _)| k)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    for key in SETTING_KEYS {
        let value = settings.get(key).unwrap_or_default();
        let origin = if stored.iter().any(|k| k == key) {
            ""
        } else {
            " (default)"
        };
        println!("{key} = {value}{origin}");
    }
    Ok(())
}

fn config_clear(config_db: &ConfigDb, key: &str) -> Result<()> {
    if !SETTING_KEYS.contains(&key) {
        return Err(Error::InvalidConfig {
            key: "key",
            reason: format!("unknown setting '{key}'"),
        });
    }
    if config_db.remove_setting(key)? {
        println!("Cleared {key}");
    } else {
        println!("{key} was not set");
    }
    Ok(())
}
