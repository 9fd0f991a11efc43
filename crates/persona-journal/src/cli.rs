//! Command-line front end over the `Journal` command surface

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::catalog::PersonaCatalog;
use crate::journal::{DestructiveConfirmation, Journal};
use crate::journal_db::{FlowMode, LinkedPersona, PRESET_COLORS};

/// Persona journal - converse with your own perspectives, stored locally
#[derive(Parser, Debug)]
#[command(name = "persona-journal")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the key and the database if they do not exist yet
    Init,

    /// Start a conversation
    New {
        title: String,
        /// Persona ids to link (built-in or custom); `user` is always linked
        #[arg(short, long = "persona", num_args = 1..)]
        personas: Vec<String>,
        /// full_control or random
        #[arg(short, long, default_value = "full_control")]
        mode: FlowMode,
    },

    /// Change the flow mode of a conversation that has no messages yet
    Mode {
        conversation: String,
        mode: FlowMode,
    },

    /// Add personas to an existing conversation
    Link {
        conversation: String,
        #[arg(required = true)]
        personas: Vec<String>,
    },

    /// Write a message
    Send {
        conversation: String,
        text: String,
        /// Author persona; defaults to whoever's turn it is
        #[arg(long = "as")]
        persona: Option<String>,
    },

    /// Skip to the next persona in a random conversation
    Next { conversation: String },

    /// Check that a persona can speak in a full_control conversation
    Select {
        conversation: String,
        persona: String,
    },

    /// List conversations, most recently active first
    List,

    /// Show the latest messages of a conversation
    Show {
        conversation: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List built-in packs and custom personas
    Personas,

    /// Author a custom persona
    CreatePersona {
        name: String,
        perspective: String,
        /// #RRGGBB; defaults to the first preset color
        #[arg(long)]
        color: Option<String>,
    },

    /// Row counts and file size
    Stats,

    /// Delete every conversation, message and persona
    Reset {
        #[arg(long)]
        yes: bool,
    },

    /// Delete the database key; existing data becomes unreadable
    ForgetKey {
        #[arg(long)]
        yes: bool,
    },
}

pub async fn run(cli: Cli, journal: &Journal) -> Result<()> {
    // Deleting the key must not create one first.
    if !matches!(cli.command, Commands::ForgetKey { .. }) {
        journal.open().await.context("Failed to open the journal")?;
    }
    let result = dispatch(cli.command, journal).await;
    journal.close().await;
    result
}

async fn dispatch(command: Commands, journal: &Journal) -> Result<()> {
    match command {
        Commands::Init => {
            let stats = journal.stats().await?;
            println!(
                "Journal ready (schema v{}, {} conversations).",
                stats.schema_version, stats.total_conversations
            );
        }
        Commands::New {
            title,
            personas,
            mode,
        } => {
            let conversation = journal.create_conversation(&title).await?;
            let linked = journal.link_personas(&conversation.id, &personas).await?;
            println!("{}", conversation.id);
            print_personas(&linked);
            if mode == FlowMode::Random {
                if let Some(turn) = journal.set_flow_mode(&conversation.id, mode).await? {
                    println!("First up: {}", turn.persona.name);
                }
            }
        }
        Commands::Mode { conversation, mode } => {
            match journal.set_flow_mode(&conversation, mode).await? {
                Some(turn) => println!("Random order set. First up: {}", turn.persona.name),
                None => println!("Full control: pick any persona with --as."),
            }
        }
        Commands::Link {
            conversation,
            personas,
        } => {
            let linked = journal.link_personas(&conversation, &personas).await?;
            print_personas(&linked);
        }
        Commands::Send {
            conversation,
            text,
            persona,
        } => {
            let persona = match persona {
                Some(persona) => persona,
                None => journal.active_persona(&conversation).await?.persona_id,
            };
            let outcome = journal.append_message(&conversation, &persona, &text).await?;
            println!(
                "[{}] {} ({})",
                outcome.message.created_at.to_rfc3339(),
                persona,
                outcome.side.as_str()
            );
            if let Some(turn) = outcome.next_turn {
                println!("Next: {}", turn.persona.name);
            }
        }
        Commands::Next { conversation } => {
            let turn = journal.advance_sequence(&conversation).await?;
            println!(
                "Now speaking: {} ({}/{})",
                turn.persona.name,
                turn.index + 1,
                turn.sequence_len
            );
        }
        Commands::Select {
            conversation,
            persona,
        } => {
            let persona = journal.select_persona(&conversation, &persona).await?;
            println!("{} can speak here; send with --as {}", persona.name, persona.persona_id);
        }
        Commands::List => {
            for summary in journal.list_conversations().await? {
                let preview = summary
                    .latest_message
                    .map(|m| m.content)
                    .unwrap_or_else(|| "(no messages yet)".to_string());
                println!(
                    "{}  {}  [{}]  {}",
                    summary.conversation.id,
                    summary.conversation.title,
                    summary.conversation.flow_mode.as_str(),
                    preview
                );
            }
        }
        Commands::Show {
            conversation,
            limit,
        } => {
            let personas = journal.conversation_personas(&conversation).await?;
            for message in journal.list_messages(&conversation, limit).await? {
                let author = personas
                    .iter()
                    .find(|p| p.persona_id == message.persona_id);
                let name = author.map_or(message.persona_id.as_str(), |p| p.name.as_str());
                let side = author
                    .and_then(|p| p.side)
                    .map_or("-", |side| side.as_str());
                println!("{:>5}  {}: {}", side, name, message.content);
            }
        }
        Commands::Personas => {
            print_catalog(journal.catalog());
            let custom = journal.list_custom_personas().await?;
            if !custom.is_empty() {
                println!("Custom");
                for persona in custom {
                    println!("  {:<40} {} {}", persona.id, persona.color, persona.name);
                }
            }
        }
        Commands::CreatePersona {
            name,
            perspective,
            color,
        } => {
            let color = color.unwrap_or_else(|| PRESET_COLORS[0].to_string());
            let persona = journal.create_persona(&name, &perspective, &color).await?;
            println!("{}", persona.id);
        }
        Commands::Stats => {
            let stats = journal.stats().await?;
            println!("schema version  {}", stats.schema_version);
            println!("personas        {}", stats.total_personas);
            println!("conversations   {}", stats.total_conversations);
            println!("messages        {}", stats.total_messages);
            println!("links           {}", stats.total_links);
            println!("size (bytes)    {}", stats.database_size_bytes);
        }
        Commands::Reset { yes } => {
            confirm(yes, "reset")?;
            journal
                .reset_store(DestructiveConfirmation::acknowledge_data_loss())
                .await?;
            println!("Journal reset.");
        }
        Commands::ForgetKey { yes } => {
            confirm(yes, "forget-key")?;
            journal
                .forget_key(DestructiveConfirmation::acknowledge_data_loss())
                .await?;
            println!("Database key deleted.");
        }
    }
    Ok(())
}

fn confirm(yes: bool, command: &str) -> Result<()> {
    if !yes {
        eprintln!("This permanently destroys journal data and cannot be undone.");
        bail!("refusing to run `{}` without --yes", command);
    }
    Ok(())
}

fn print_personas(personas: &[LinkedPersona]) {
    for persona in personas {
        let side = persona.side.map_or("unassigned", |side| side.as_str());
        println!("  {:<24} {:<16} {}", persona.persona_id, persona.name, side);
    }
}

fn print_catalog(catalog: &PersonaCatalog) {
    for pack in catalog.packs() {
        println!("{} - {}", pack.name, pack.description);
        for persona in &pack.personas {
            println!("  {:<24} {} {}", persona.id, persona.color, persona.name);
        }
    }
}
