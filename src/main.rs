//! spellfun - command-line front end for the SpellFun practice core.

use clap::{Parser, Subcommand};
use spellfun::app::{AppContext, AppError};
use spellfun::backends::{DownloadProgress, ProgressCallback, VoiceMethod};
use spellfun::models::{parse_word_list, NonEmptyString};
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Spelling practice storage and voice tools
#[derive(Parser)]
#[command(name = "spellfun")]
#[command(version)]
#[command(about = "Manage SpellFun users, lessons and practice voices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List users
    Users,

    /// Create a user
    AddUser {
        /// Display name
        name: String,
    },

    /// List a user's lessons with their progress, newest first
    Lessons {
        user_id: String,
    },

    /// Create a lesson from a comma separated word list
    AddLesson {
        user_id: String,
        /// Lesson name
        name: String,
        /// Words, e.g. "cat, dog, bird"
        words: String,
    },

    /// Show a user's progress records
    Progress {
        user_id: String,
    },

    /// Record one successful completion of a lesson
    Complete {
        lesson_id: String,
        user_id: String,
    },

    /// Speak text with the configured voice
    Say {
        text: String,
        /// Voice id (neural voice id, or a device voice preference)
        #[arg(short, long)]
        voice: Option<String>,
        /// Voice method: device or neural
        #[arg(short, long)]
        method: Option<VoiceMethod>,
    },

    /// List available voices
    Voices {
        /// Also list every voice in the remote neural repository
        #[arg(long)]
        remote: bool,
    },

    /// Download a neural voice
    Download {
        voice_id: String,
    },

    /// Delete all local users, lessons and progress
    Reset {
        /// Confirm the irreversible reset
        #[arg(long)]
        yes: bool,
    },
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|p: DownloadProgress| {
        let name = p.url.rsplit('/').next().unwrap_or_default();
        match p.percent() {
            Some(pct) => eprint!("\r{}: {:>3}%", name, pct),
            None => eprint!("\r{}: {} bytes", name, p.loaded),
        }
        let _ = std::io::stderr().flush();
    })
}

async fn run(ctx: AppContext, command: Commands) -> Result<(), AppError> {
    match command {
        Commands::Users => {
            let users = ctx.persistence.list_users().await?;
            if users.is_empty() {
                println!("No users yet.");
            }
            for user in users {
                println!("{}  {}", user.id, user.name);
            }
        }

        Commands::AddUser { name } => {
            let name = NonEmptyString::new(&name)
                .ok_or_else(|| AppError::Invalid("user name must not be empty".to_string()))?;
            let user = ctx.persistence.create_user(name).await?;
            println!("Created user {} ({})", user.name, user.id);
        }

        Commands::Lessons { user_id } => {
            for entry in ctx.persistence.lesson_overview(&user_id).await? {
                let completions = entry
                    .progress
                    .as_ref()
                    .map(|p| p.successful_completions)
                    .unwrap_or(0);
                let puzzle = if entry.progress.as_ref().is_some_and(|p| p.puzzle_unlocked()) {
                    " [puzzle]"
                } else {
                    ""
                };
                println!(
                    "{}  {} ({} words, {} completions){}",
                    entry.lesson.id,
                    entry.lesson.name,
                    entry.lesson.words.len(),
                    completions,
                    puzzle
                );
            }
        }

        Commands::AddLesson { user_id, name, words } => {
            let name = NonEmptyString::new(&name)
                .ok_or_else(|| AppError::Invalid("lesson name must not be empty".to_string()))?;
            let words = parse_word_list(&words);
            match ctx.persistence.create_lesson(&user_id, name, &words).await? {
                Some(lesson) => println!("Created lesson {} with {} words ({})", lesson.name, lesson.words.len(), lesson.id),
                None => return Err(AppError::Invalid("a lesson needs at least one word".to_string())),
            }
        }

        Commands::Progress { user_id } => {
            for p in ctx.persistence.list_progress_for_user(&user_id).await? {
                println!(
                    "{}  {} completions, last practiced {}",
                    p.lesson_id,
                    p.successful_completions,
                    p.last_practiced.to_rfc3339()
                );
            }
        }

        Commands::Complete { lesson_id, user_id } => {
            if ctx.persistence.get_lesson(&lesson_id).await?.is_none() {
                return Err(AppError::Invalid(format!("no lesson {}", lesson_id)));
            }
            let outcome = ctx.persistence.complete_lesson(&lesson_id, &user_id).await?;
            println!("Completions: {}", outcome.progress.successful_completions);
            if outcome.puzzle_unlocked {
                println!("Puzzle unlocked!");
            }
        }

        Commands::Say { text, voice, method } => {
            if let Some(method) = method {
                ctx.voice.set_method(method);
            }
            let voice_id = voice.unwrap_or_else(|| ctx.default_voice_id().to_string());
            if ctx.voice.method() == VoiceMethod::Neural {
                ctx.voice.ensure_ready(&voice_id, Some(progress_printer())).await?;
            } else {
                ctx.voice.ensure_ready(&voice_id, None).await?;
            }
            ctx.voice.speak(&text, &voice_id).await?;
        }

        Commands::Voices { remote } => {
            println!("Device voices:");
            for v in ctx.device_voices().await {
                println!("  {}  {} [{}]", v.id, v.name, v.language);
            }
            println!("Neural voices:");
            for (v, cached) in ctx.neural_voices() {
                println!("  {}{}", v.id, if cached { "  (downloaded)" } else { "" });
            }
            if remote {
                println!("Repository voices:");
                for v in ctx.downloadable_voices().await? {
                    println!("  {}  {} [{}]", v.id, v.name, v.language);
                }
            }
        }

        Commands::Download { voice_id } => {
            ctx.voice.set_method(VoiceMethod::Neural);
            ctx.voice.ensure_ready(&voice_id, Some(progress_printer())).await?;
            eprintln!();
            println!("Voice {} is ready", voice_id);
        }

        Commands::Reset { yes } => {
            if !yes {
                return Err(AppError::Invalid(
                    "reset deletes every user, lesson and progress record; pass --yes to confirm".to_string(),
                ));
            }
            ctx.persistence.reset_all().await?;
            println!("All local data deleted.");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spellfun=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::load()?;
    info!("data directory: {}", ctx.settings.data_dir);

    run(ctx, cli.command).await?;
    Ok(())
}
