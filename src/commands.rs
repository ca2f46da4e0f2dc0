//! Subcommands and their execution against the cached client.

use std::path::{Component, Path, PathBuf};

use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use leadsync::api::types::{JobKind, JobSpec, LeadFilter, LeadPatch, NewLead, NewTag};
use leadsync::api::CachedClient;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Check whether the service is up
  Health,
  /// List the job kinds the service can run
  Scrapers,
  /// Scraping jobs
  #[command(subcommand)]
  Jobs(JobCommand),
  /// Leads
  #[command(subcommand)]
  Leads(LeadCommand),
  /// Notes on a lead
  #[command(subcommand)]
  Notes(NoteCommand),
  /// Tags and tag assignments
  #[command(subcommand)]
  Tags(TagCommand),
}

#[derive(Subcommand, Debug)]
pub enum JobCommand {
  List {
    #[arg(short, long)]
    kind: Option<String>,
  },
  Show {
    id: String,
  },
  /// Submit a job, e.g. `jobs submit "Acme Search" google_maps -p location=NYC -p maxResults=50`
  Submit {
    name: String,
    kind: String,
    /// Kind-specific parameter as key=value; values that parse as JSON are sent as JSON
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
    #[arg(short, long = "tag")]
    tags: Vec<String>,
  },
  /// Print the job's status every poll until it finishes
  Watch {
    id: String,
  },
  Delete {
    id: String,
  },
  Results {
    id: String,
  },
  /// Save the job's CSV export
  Download {
    id: String,
    /// Directory to write into
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
  },
}

#[derive(Args, Debug, Default)]
pub struct LeadFields {
  #[arg(long)]
  pub name: Option<String>,
  #[arg(long)]
  pub email: Option<String>,
  #[arg(long)]
  pub phone: Option<String>,
  #[arg(long)]
  pub company: Option<String>,
  #[arg(long)]
  pub website: Option<String>,
  #[arg(long)]
  pub address: Option<String>,
  #[arg(long)]
  pub status: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum LeadCommand {
  List {
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long = "job")]
    job_id: Option<String>,
  },
  Show {
    id: String,
  },
  Create {
    #[command(flatten)]
    fields: LeadFields,
  },
  Update {
    id: String,
    #[command(flatten)]
    fields: LeadFields,
  },
  Delete {
    id: String,
  },
  Stats,
  /// Turn a finished job's results into leads
  Import {
    job_id: String,
  },
  BulkDelete {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  BulkStatus {
    #[arg(long)]
    status: String,
    #[arg(required = true)]
    ids: Vec<String>,
  },
}

#[derive(Subcommand, Debug)]
pub enum NoteCommand {
  List { lead_id: String },
  Add { lead_id: String, content: String },
  Delete { lead_id: String, note_id: String },
}

#[derive(Subcommand, Debug)]
pub enum TagCommand {
  List,
  Create {
    name: String,
    #[arg(long)]
    color: Option<String>,
  },
  Delete {
    id: String,
  },
  /// Attach a tag to a lead
  Add { lead_id: String, tag_id: String },
  /// Detach a tag from a lead
  Remove { lead_id: String, tag_id: String },
}

/// Parse `key=value`. The value is JSON when it parses as JSON, else a string.
pub fn parse_param(input: &str) -> Result<(String, Value), String> {
  let (key, value) = input
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got {:?}", input))?;
  let key = key.trim();
  if key.is_empty() {
    return Err(format!("missing parameter name in {:?}", input));
  }
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

/// Place a server-named file inside `out`, refusing names that would leave it.
fn download_path(out: &Path, file_name: &str) -> Result<PathBuf> {
  match Path::new(file_name).components().collect::<Vec<_>>().as_slice() {
    [Component::Normal(name)] => Ok(out.join(name)),
    _ => Err(eyre!("Refusing to save download as {:?}", file_name)),
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

pub async fn run(client: &CachedClient, command: Command) -> Result<()> {
  match command {
    Command::Health => {
      let up = *client.health().await?;
      println!("{}", if up { "up" } else { "down" });
    }
    Command::Scrapers => {
      for kind in client.scrapers().await?.iter() {
        println!("{}", kind);
      }
    }
    Command::Jobs(command) => run_job(client, command).await?,
    Command::Leads(command) => run_lead(client, command).await?,
    Command::Notes(command) => run_note(client, command).await?,
    Command::Tags(command) => run_tag(client, command).await?,
  }
  Ok(())
}

async fn run_job(client: &CachedClient, command: JobCommand) -> Result<()> {
  match command {
    JobCommand::List { kind } => {
      let jobs = client.jobs(kind.as_deref().map(JobKind::from)).await?;
      for job in jobs.iter() {
        println!(
          "{}\t{}\t{}\t{}\t{}",
          job.id, job.kind, job.status, job.results_count, job.name
        );
      }
    }
    JobCommand::Show { id } => print_json(&*client.job(&id).await?)?,
    JobCommand::Submit {
      name,
      kind,
      params,
      tags,
    } => {
      let mut spec = JobSpec::new(name, JobKind::from(kind.as_str()));
      for (key, value) in params {
        spec = spec.param(key, value);
      }
      for tag in tags {
        spec = spec.tag(tag);
      }
      println!("{}", client.submit_job(&spec).await?);
    }
    JobCommand::Watch { id } => {
      let mut updates = Box::pin(client.watch_job(&id));
      while let Some(update) = updates.next().await {
        match update {
          Ok(job) => println!("{}\t{}\t{} results", job.id, job.status, job.results_count),
          Err(e) if e.is_not_found() => return Err(e.into()),
          Err(e) => eprintln!("poll failed: {}", e),
        }
      }
    }
    JobCommand::Delete { id } => client.delete_job(&id).await?,
    JobCommand::Results { id } => print_json(&*client.job_results(&id).await?)?,
    JobCommand::Download { id, out } => {
      let job = client.job(&id).await?;
      let download = client.download_results(&job).await?;
      let path = download_path(&out, &download.file_name)?;
      std::fs::write(&path, &download.bytes)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("{}", path.display());
    }
  }
  Ok(())
}

async fn run_lead(client: &CachedClient, command: LeadCommand) -> Result<()> {
  match command {
    LeadCommand::List {
      status,
      tag,
      search,
      job_id,
    } => {
      let filter = LeadFilter {
        status,
        tag,
        search,
        job_id,
      };
      for lead in client.leads(filter).await?.iter() {
        println!(
          "{}\t{}\t{}\t{}",
          lead.id,
          lead.status,
          lead.name,
          lead.company.as_deref().unwrap_or("-")
        );
      }
    }
    LeadCommand::Show { id } => print_json(&*client.lead(&id).await?)?,
    LeadCommand::Create { fields } => {
      let name = fields
        .name
        .ok_or_else(|| eyre!("--name is required to create a lead"))?;
      let lead = NewLead {
        name,
        email: fields.email,
        phone: fields.phone,
        company: fields.company,
        website: fields.website,
        address: fields.address,
        status: fields.status,
        ..NewLead::default()
      };
      println!("{}", client.create_lead(&lead).await?);
    }
    LeadCommand::Update { id, fields } => {
      let patch = LeadPatch {
        name: fields.name,
        email: fields.email,
        phone: fields.phone,
        company: fields.company,
        website: fields.website,
        address: fields.address,
        status: fields.status,
      };
      if patch == LeadPatch::default() {
        return Err(eyre!("Nothing to update"));
      }
      print_json(&client.update_lead(&id, &patch).await?)?;
    }
    LeadCommand::Delete { id } => client.delete_lead(&id).await?,
    LeadCommand::Stats => print_json(&*client.lead_stats().await?)?,
    LeadCommand::Import { job_id } => {
      let summary = client.import_leads_from_job(&job_id).await?;
      println!("imported {} of {}", summary.imported, summary.total);
    }
    LeadCommand::BulkDelete { ids } => {
      let summary = client.bulk_delete_leads(&ids).await?;
      println!("deleted {}", summary.deleted);
    }
    LeadCommand::BulkStatus { status, ids } => {
      let summary = client.bulk_update_lead_status(&ids, &status).await?;
      println!("updated {}", summary.updated);
    }
  }
  Ok(())
}

async fn run_note(client: &CachedClient, command: NoteCommand) -> Result<()> {
  match command {
    NoteCommand::List { lead_id } => {
      for note in client.lead_notes(&lead_id).await?.iter() {
        println!("{}\t{}", note.id, note.content);
      }
    }
    NoteCommand::Add { lead_id, content } => {
      let note = client.add_note(&lead_id, &content).await?;
      println!("{}", note.id);
    }
    NoteCommand::Delete { lead_id, note_id } => client.delete_note(&lead_id, &note_id).await?,
  }
  Ok(())
}

async fn run_tag(client: &CachedClient, command: TagCommand) -> Result<()> {
  match command {
    TagCommand::List => {
      for tag in client.tags().await?.iter() {
        println!("{}\t{}", tag.id, tag.name);
      }
    }
    TagCommand::Create { name, color } => {
      let tag = client.create_tag(&NewTag { name, color }).await?;
      println!("{}", tag.id);
    }
    TagCommand::Delete { id } => client.delete_tag(&id).await?,
    TagCommand::Add { lead_id, tag_id } => client.tag_lead(&lead_id, &tag_id).await?,
    TagCommand::Remove { lead_id, tag_id } => client.untag_lead(&lead_id, &tag_id).await?,
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_param_keeps_json_types() {
    assert_eq!(
      parse_param("maxResults=50").unwrap(),
      ("maxResults".to_string(), json!(50))
    );
    assert_eq!(
      parse_param("location=NYC").unwrap(),
      ("location".to_string(), json!("NYC"))
    );
    assert_eq!(
      parse_param("query=a=b").unwrap(),
      ("query".to_string(), json!("a=b"))
    );
  }

  #[test]
  fn test_download_path_stays_in_output_dir() {
    let out = Path::new("/tmp/out");
    assert_eq!(
      download_path(out, "Acme_Search_results.csv").unwrap(),
      PathBuf::from("/tmp/out/Acme_Search_results.csv")
    );
    assert!(download_path(out, "../../etc/cron.d/x_results.csv").is_err());
    assert!(download_path(out, "/etc/passwd").is_err());
    assert!(download_path(out, "..").is_err());
  }

  #[test]
  fn test_parse_param_rejects_missing_key() {
    assert!(parse_param("NYC").is_err());
    assert!(parse_param("=NYC").is_err());
  }
}
