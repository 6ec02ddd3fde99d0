use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event as XmlEvent;
use rand::SeedableRng;
use rand::rngs::StdRng;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

include!("types.rs");
include!("normalize.rs");
include!("fetch.rs");
include!("sitemap.rs");
include!("feed.rs");
include!("extract.rs");
include!("score.rs");
include!("crawl.rs");
include!("data_io.rs");
include!("draft.rs");
include!("runtime.rs");
include!("test_support.rs");
