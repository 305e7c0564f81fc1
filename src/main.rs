use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use learnhub::api::{
  ChatMessage, DiscussionPost, HubClient, HubKey, NewDiscussionPost, NewQuizResponse,
  QuizResponse,
};
use learnhub::config::Config;
use learnhub::event::{Event, EventHandler};
use learnhub::query::QueryState;
use learnhub::resources::Resource;
use learnhub::server::Server;

#[derive(Parser, Debug)]
#[command(name = "learnhub")]
#[command(about = "Learning hub record store and command-line client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/learnhub/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Record store URL (overrides the config file and LEARNHUB_API_URL)
  #[arg(long, global = true)]
  url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the record store
  Serve {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
  },
  /// Quiz answers
  Quiz {
    #[command(subcommand)]
    action: QuizAction,
  },
  /// Chat simulator
  Chat {
    #[command(subcommand)]
    action: ChatAction,
  },
  /// Discussion board
  Discussion {
    #[command(subcommand)]
    action: DiscussionAction,
  },
  /// Print a collection and keep printing new records
  Watch {
    /// quiz, chat or discussion (aliases accepted)
    resource: Resource,

    /// Seconds between refetches
    #[arg(short, long, default_value_t = 2)]
    interval: u64,
  },
}

#[derive(Subcommand, Debug)]
enum QuizAction {
  /// Record an answer
  Submit {
    question: String,
    answer: String,
    /// Mark the answer as correct
    #[arg(long)]
    correct: bool,
  },
  /// List recorded answers
  List,
}

#[derive(Subcommand, Debug)]
enum ChatAction {
  /// Send a message and store the simulated reply
  Send { text: String },
  /// Show the chat history
  List,
}

#[derive(Subcommand, Debug)]
enum DiscussionAction {
  /// Add a post to the board
  Post { author: String, content: String },
  /// List posts
  List,
}

const TICK_RATE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.url {
    config.api.base_url = url;
  }

  let _log_guard = learnhub::logging::init(&config.log)?;

  match args.command {
    Command::Serve { port } => {
      if let Some(port) = port {
        config.server.port = port;
      }
      let server = Server::bind(config.server.bind_addr()?).await?;
      server.run().await
    }
    Command::Quiz { action } => {
      let hub = HubClient::new(&config)?;
      match action {
        QuizAction::Submit {
          question,
          answer,
          correct,
        } => {
          let stored = hub
            .submit_quiz(&NewQuizResponse {
              question,
              answer,
              is_correct: correct,
            })
            .await?;
          println!("{}", stored);
        }
        QuizAction::List => print_records(&hub.quiz_responses().await?, "No quiz answers yet"),
      }
      Ok(())
    }
    Command::Chat { action } => {
      let hub = HubClient::new(&config)?;
      match action {
        ChatAction::Send { text } => {
          let (sent, reply) = hub.send_chat(&text).await?;
          println!("{}", sent);
          println!("{}", reply);
        }
        ChatAction::List => print_records(&hub.chat_history().await?, "No messages yet"),
      }
      Ok(())
    }
    Command::Discussion { action } => {
      let hub = HubClient::new(&config)?;
      match action {
        DiscussionAction::Post { author, content } => {
          let post = hub
            .post_discussion(&NewDiscussionPost { content, author })
            .await?;
          println!("{}", post);
        }
        DiscussionAction::List => {
          print_records(&hub.discussion_posts().await?, "No posts yet")
        }
      }
      Ok(())
    }
    Command::Watch { resource, interval } => {
      let hub = HubClient::new(&config)?;
      let interval = Duration::from_secs(interval.max(1));
      match resource {
        Resource::Quiz => watch::<QuizResponse>(&hub, resource, interval).await,
        Resource::Chat => watch::<ChatMessage>(&hub, resource, interval).await,
        Resource::Discussion => watch::<DiscussionPost>(&hub, resource, interval).await,
      }
    }
  }
}

fn print_records<T: Display>(records: &[T], empty: &str) {
  if records.is_empty() {
    println!("{}", empty);
  }
  for record in records {
    println!("{}", record);
  }
}

/// Observe a collection, refetching every `interval`, and print records as
/// they appear.
async fn watch<T>(hub: &HubClient, resource: Resource, interval: Duration) -> Result<()>
where
  T: DeserializeOwned + Clone + Display,
{
  let mut query = hub.observe::<Vec<T>>(HubKey::list(resource));
  let mut events = EventHandler::new(TICK_RATE);
  let mut printed = 0;
  let mut last_fetch: Option<Instant> = None;
  let mut last_error: Option<String> = None;

  println!("Watching {} (Ctrl-C to stop)", resource);
  while let Some(event) = events.next().await {
    match event {
      Event::Shutdown => break,
      Event::Tick => {
        if last_fetch.map_or(true, |at| at.elapsed() >= interval) {
          query.refetch();
          last_fetch = Some(Instant::now());
        }
        if !query.poll() {
          continue;
        }

        match query.state() {
          QueryState::Success(records) => {
            for record in records.iter().skip(printed) {
              println!("{}", record);
            }
            printed = printed.max(records.len());
            last_error = None;
          }
          QueryState::Error(e) => {
            if last_error.as_deref() != Some(e.as_str()) {
              eprintln!("error: {}", e);
              last_error = Some(e.clone());
            }
          }
          QueryState::Idle | QueryState::Loading => {}
        }
      }
    }
  }

  hub.dispose();
  Ok(())
}
