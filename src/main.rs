mod prompt;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use hearth_vault::config::{Config, store_root};
use hearth_vault::crypto::{PasswordCharset, generate_new_config, generate_password};
use hearth_vault::session::{clear_cached_session, load_or_unlock};
use hearth_vault::strength::StrengthCriteria;
use hearth_vault::{
    Category, JsonRowStore, ListFilter, NewPassword, PasswordRecord, PasswordUpdate,
    SessionContext, Vault, XChaChaCodec, evaluate,
};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::prompt::{prompt_optional, prompt_password_hidden, prompt_string};

const GENERATED_LENGTH: usize = 24;

#[derive(Parser, Debug)]
#[command(name = "hv", version, about = "Household password vault")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the vault
    Init,

    /// Add a new entry
    Add {
        /// Service name, e.g. "Electric company"
        service: String,
        /// financial, travel, household, shopping, social, work, entertainment, utilities, other or free text
        #[arg(long)]
        category: Option<String>,
        /// Comma separated tags
        #[arg(long)]
        tags: Option<String>,
        /// Mark as favorite
        #[arg(long)]
        favorite: bool,
        /// Account ids to share with
        #[arg(long = "share")]
        share: Vec<String>,
    },

    /// Show entry
    Show {
        /// Entry id or service name
        entry: String,
        /// Show only password
        #[arg(long)]
        password_only: bool,
        /// Show as JSON
        #[arg(long)]
        json: bool,
    },

    /// List entries
    ///
    /// Examples:
    ///   hv ls
    ///   hv ls bank --category financial
    Ls {
        /// Matches service name, username, url or tag
        query: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Only favorites
        #[arg(long)]
        favorites: bool,
        /// Show as JSON (includes secrets)
        #[arg(long)]
        json: bool,
    },

    /// Edit an entry
    Edit {
        /// Entry id or service name
        entry: String,
        /// Prompt for a new password (empty generates one)
        #[arg(long)]
        password: bool,
        #[arg(long)]
        service: Option<String>,
        /// Empty string clears it
        #[arg(long)]
        username: Option<String>,
        /// Empty string clears it
        #[arg(long)]
        url: Option<String>,
        /// Empty string clears it
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Comma separated tags, replaces the current ones
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        favorite: Option<bool>,
        /// Replace the share list
        #[arg(long = "share")]
        share: Vec<String>,
        /// Stop sharing with everyone
        #[arg(long, conflicts_with = "share")]
        unshare_all: bool,
    },

    /// Delete an entry permanently
    Rm {
        /// Entry id or service name
        entry: String,
    },

    /// Rate a password (prompts when not given)
    Strength { password: Option<String> },

    /// Generate a password
    Generate {
        #[arg(long, default_value_t = GENERATED_LENGTH)]
        length: usize,
        #[arg(long)]
        no_upper: bool,
        #[arg(long)]
        no_lower: bool,
        #[arg(long)]
        no_digits: bool,
        #[arg(long)]
        no_symbols: bool,
    },

    /// Forget the cached session key
    Lock,
}

type CliVault = Vault<XChaChaCodec, JsonRowStore>;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = store_root()?;

    let log_level = Config::load(&root)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "warn".to_string());
    init_logging(&log_level);

    match cli.command {
        Commands::Init => cmd_init(&root)?,
        Commands::Add {
            service,
            category,
            tags,
            favorite,
            share,
        } => cmd_add(&root, service, category, tags, favorite, share)?,
        Commands::Show {
            entry,
            password_only,
            json,
        } => cmd_show(&root, &entry, password_only, json)?,
        Commands::Ls {
            query,
            category,
            favorites,
            json,
        } => {
            let filter = ListFilter {
                category: category.as_deref().map(Category::parse),
                favorites_only: favorites,
                query,
            };
            cmd_ls(&root, &filter, json)?
        }
        Commands::Edit {
            entry,
            password,
            service,
            username,
            url,
            notes,
            category,
            tags,
            favorite,
            share,
            unshare_all,
        } => {
            let password = if password {
                Some(ask_new_password()?)
            } else {
                None
            };
            let shared_with = if unshare_all {
                Some(Vec::new())
            } else if share.is_empty() {
                None
            } else {
                Some(share)
            };
            let changes = PasswordUpdate {
                service_name: service,
                username: username.map(Some),
                password,
                url: url.map(Some),
                category: category.as_deref().map(Category::parse),
                notes: notes.map(Some),
                tags: tags.as_deref().map(split_tags),
                is_favorite: favorite,
                shared_with,
            };
            cmd_edit(&root, &entry, changes)?
        }
        Commands::Rm { entry } => cmd_rm(&root, &entry)?,
        Commands::Strength { password } => cmd_strength(password)?,
        Commands::Generate {
            length,
            no_upper,
            no_lower,
            no_digits,
            no_symbols,
        } => {
            let charset = PasswordCharset {
                upper: !no_upper,
                lower: !no_lower,
                digits: !no_digits,
                symbols: !no_symbols,
            };
            let pw = generate_password(length, charset)?;
            println!("{pw}");
            eprintln!("Strength: {}", evaluate(&pw));
        }
        Commands::Lock => {
            if clear_cached_session(&root)? {
                println!("Session locked.");
            } else {
                println!("No active session.");
            }
        }
    }

    Ok(())
}

/// Log to stderr; `RUST_LOG` wins over the configured level.
fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Unable to set global default subscriber");
    }
}

fn open_vault(root: &Path) -> anyhow::Result<(Config, SessionContext, CliVault)> {
    let cfg = Config::load(root)?;
    let session = load_or_unlock(&cfg, root, || prompt_password_hidden("Master password: "))?;
    let vault = Vault::new(XChaChaCodec, JsonRowStore::open(root)?)
        .with_notes_fallback(cfg.notes_on_decrypt_error);
    Ok((cfg, session, vault))
}

/// Match by id first, then by case-insensitive service name.
fn find_entry(
    vault: &CliVault,
    cfg: &Config,
    session: &SessionContext,
    needle: &str,
) -> anyhow::Result<PasswordRecord> {
    let records = vault.list(Some(session), &cfg.owner_id, &ListFilter::default())?;
    if let Some(rec) = records.iter().find(|r| r.id == needle) {
        return Ok(rec.clone());
    }
    let mut matches: Vec<PasswordRecord> = records
        .into_iter()
        .filter(|r| r.service_name.eq_ignore_ascii_case(needle))
        .collect();
    match matches.len() {
        0 => Err(anyhow!("No entry named {needle}")),
        1 => Ok(matches.remove(0)),
        _ => {
            let ids: Vec<&str> = matches.iter().map(|r| r.id.as_str()).collect();
            Err(anyhow!(
                "Several entries are named {needle}, use an id: {}",
                ids.join(", ")
            ))
        }
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',').map(|t| t.trim().to_string()).collect()
}

fn ask_new_password() -> anyhow::Result<String> {
    let password = prompt_password_hidden("Password (leave empty to generate): ")?;
    if password.is_empty() {
        generate_password(GENERATED_LENGTH, PasswordCharset::default())
    } else {
        Ok(password)
    }
}

fn cmd_init(root: &Path) -> anyhow::Result<()> {
    if hearth_vault::config::config_path(root).exists() {
        println!("Vault already exists at: {}", root.display());
        return Ok(());
    }

    std::fs::create_dir_all(root)?;
    let master_password = prompt_password_hidden("New master password: ")?;
    let confirm = prompt_password_hidden("Confirm master password: ")?;
    if master_password != confirm {
        bail!("Passwords do not match");
    }
    if master_password.is_empty() {
        bail!("Master password must not be empty");
    }

    let owner_id = uuid::Uuid::new_v4().to_string();
    let config = generate_new_config(&master_password, &owner_id)?;
    config.save(root)?;

    println!("Initialized vault at {}", root.display());
    Ok(())
}

fn cmd_add(
    root: &Path,
    service: String,
    category: Option<String>,
    tags: Option<String>,
    favorite: bool,
    share: Vec<String>,
) -> anyhow::Result<()> {
    let (cfg, session, mut vault) = open_vault(root)?;

    let username = prompt_optional("Username (optional): ")?;
    let password = ask_new_password()?;
    let url = prompt_optional("URL (optional): ")?;
    let notes = prompt_optional("Notes (optional): ")?;

    let input = NewPassword {
        service_name: service,
        username,
        password,
        url,
        category: category.as_deref().map(Category::parse).unwrap_or_default(),
        notes,
        tags: tags.as_deref().map(split_tags).unwrap_or_default(),
        is_favorite: favorite,
        shared_with: share,
    };

    let rec = vault.create(Some(&session), &cfg.owner_id, input)?;
    println!(
        "Saved {} ({}), strength: {}",
        rec.service_name, rec.id, rec.strength
    );
    Ok(())
}

fn cmd_show(root: &Path, needle: &str, password_only: bool, json: bool) -> anyhow::Result<()> {
    let (cfg, session, vault) = open_vault(root)?;
    let rec = find_entry(&vault, &cfg, &session, needle)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rec)?);
        return Ok(());
    }

    if password_only {
        println!("{}", rec.secret);
        return Ok(());
    }

    println!("Service:  {}", rec.service_name);
    println!("Id:       {}", rec.id);
    if let Some(ref u) = rec.username {
        println!("Username: {u}");
    }
    println!("Password: {}", rec.secret);
    println!("Strength: {}", rec.strength);
    if let Some(ref url) = rec.url {
        println!("URL:      {url}");
    }
    println!("Category: {}", rec.category);
    if !rec.tags.is_empty() {
        let tags: Vec<&str> = rec.tags.iter().map(String::as_str).collect();
        println!("Tags:     {}", tags.join(", "));
    }
    if let Some(ref notes) = rec.notes {
        println!("Notes:    {notes}");
    }
    if rec.is_shared {
        println!("Shared:   {}", rec.shared_with.join(", "));
    }
    println!("Created:  {}", rec.created_at.format(&Rfc3339)?);
    println!("Updated:  {}", rec.updated_at.format(&Rfc3339)?);
    println!("Changed:  {}", rec.last_changed.format(&Rfc3339)?);

    Ok(())
}

fn cmd_ls(root: &Path, filter: &ListFilter, json: bool) -> anyhow::Result<()> {
    let (cfg, session, vault) = open_vault(root)?;
    let records = vault.list(Some(&session), &cfg.owner_id, filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for rec in records {
        let star = if rec.is_favorite { "*" } else { " " };
        println!(
            "{star} {:<36}  {:<28}  {:<14}  {}",
            rec.id,
            rec.service_name,
            rec.category.as_str(),
            rec.strength
        );
    }
    Ok(())
}

fn cmd_edit(root: &Path, needle: &str, changes: PasswordUpdate) -> anyhow::Result<()> {
    let (cfg, session, mut vault) = open_vault(root)?;
    let current = find_entry(&vault, &cfg, &session, needle)?;
    let rec = vault.update(Some(&session), &cfg.owner_id, &current.id, changes)?;
    println!("Updated {} ({}), strength: {}", rec.service_name, rec.id, rec.strength);
    Ok(())
}

fn cmd_rm(root: &Path, needle: &str) -> anyhow::Result<()> {
    let (cfg, session, mut vault) = open_vault(root)?;
    let current = find_entry(&vault, &cfg, &session, needle)?;

    let answer = prompt_string(&format!(
        "Delete {} ({}) permanently? [y/N] ",
        current.service_name, current.id
    ))?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        println!("Aborted.");
        return Ok(());
    }

    vault.delete(&cfg.owner_id, &current.id)?;
    println!("Deleted {}", current.service_name);
    Ok(())
}

fn cmd_strength(password: Option<String>) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt_password_hidden("Password: ")?,
    };
    let criteria = StrengthCriteria::of(&password);
    println!("{}", evaluate(&password));
    println!(
        "lowercase: {}  uppercase: {}  digit: {}  symbol: {}  12+ chars: {}",
        yes_no(criteria.lowercase),
        yes_no(criteria.uppercase),
        yes_no(criteria.digit),
        yes_no(criteria.symbol),
        yes_no(criteria.long_enough)
    );
    Ok(())
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}
