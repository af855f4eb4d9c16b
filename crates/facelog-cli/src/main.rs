use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facelog_core::{FaceEvent, SimilarityIndex};
use facelog_store::{RedisQueue, RedisVectorIndex, SqliteStore};
use facelog_vision::FacePipeline;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facelog", about = "facelog operator CLI")]
struct Cli {
    /// Shared store holding flags, the vector index and the work queue
    #[arg(long, global = true, default_value = facelog_store::DEFAULT_REDIS_URL)]
    redis_url: String,

    /// SQLite database (default: $XDG_DATA_HOME/facelog/facelog.db)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory containing the detector and recognizer models
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = facelog_store::DEFAULT_QUEUE)]
    queue: String,

    #[arg(long, global = true, default_value = facelog_store::DEFAULT_INDEX_NAME)]
    index: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a reference photo for an employee
    Enroll {
        #[arg(short, long)]
        employee: String,
        /// Display name stored with the employee
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Load every stored face vector into the vector index
    Sync,
    /// List identities present in the vector index
    List,
    /// Push a camera image onto the work queue
    Publish {
        #[arg(short, long)]
        camera: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Show the most recent transactions
    Transactions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);

    match &cli.command {
        Commands::Enroll {
            employee,
            name,
            image,
        } => {
            let model_dir = cli
                .model_dir
                .clone()
                .unwrap_or_else(facelog_vision::default_model_dir);
            let mut pipeline = FacePipeline::load(&model_dir)
                .with_context(|| format!("loading models from {}", model_dir.display()))?;
            let bytes = read_image(image)?;
            let Some(embedding) = pipeline.embed_image(&bytes)? else {
                bail!("no face detected in {}", image.display());
            };

            let db = open_db(&db_path).await?;
            db.upsert_employee(employee, name.as_deref()).await?;
            db.upsert_face_vector(employee, &embedding).await?;

            let index = open_index(&cli).await?;
            index.upsert(employee, &embedding).await?;

            tracing::info!(identity_id = %employee, fingerprint = %embedding.fingerprint(), "enrolled");
            println!("Enrolled {employee}");
        }
        Commands::Sync => {
            let db = open_db(&db_path).await?;
            let index = open_index(&cli).await?;
            let records = db.face_vectors().await?;
            for record in &records {
                index.upsert(&record.emp_id, &record.embedding).await?;
            }
            println!("Synced {} face vector(s) into {}", records.len(), cli.index);
        }
        Commands::List => {
            let index = open_index(&cli).await?;
            let ids = index.identities().await?;
            if ids.is_empty() {
                println!("No identities indexed");
            }
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Publish { camera, image } => {
            let body = FaceEvent::encode(camera, &read_image(image)?)?;
            let conn = facelog_store::connect(&cli.redis_url)
                .await
                .with_context(|| format!("connecting to {}", cli.redis_url))?;
            // The producer never consumes, so its processing list stays empty.
            let queue = RedisQueue::new(conn, &cli.queue, "publisher");
            queue.push(&body).await?;
            println!("Published {} byte(s) for camera {camera}", body.len());
        }
        Commands::Transactions { limit, json } => {
            let db = open_db(&db_path).await?;
            for tx in db.recent_transactions(*limit).await? {
                if *json {
                    println!("{}", serde_json::to_string(&tx)?);
                } else {
                    println!("{}  {:<12} {}", tx.timestamp.to_rfc3339(), tx.camera_id, tx.subject);
                }
            }
        }
    }

    Ok(())
}

fn default_db_path() -> PathBuf {
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        });
    data_dir.join("facelog").join("facelog.db")
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

async fn open_db(path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))
}

async fn open_index(cli: &Cli) -> Result<RedisVectorIndex> {
    let conn = facelog_store::connect(&cli.redis_url)
        .await
        .with_context(|| format!("connecting to {}", cli.redis_url))?;
    let index = RedisVectorIndex::new(conn, cli.index.clone());
    index.ensure_index().await.context("preparing vector index")?;
    Ok(index)
}
