//! Mapping loader, load-time validation and the reloadable query table.

mod xml;

pub use xml::parse_mapping;

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{QueryError, Result};
use crate::model::Query;
use crate::script::TEMPLATE_DIALECT;

/// Pluggable source of query definitions appended after file parsing
#[cfg_attr(test, mockall::automock)]
pub trait QueryProvider: Send + Sync {
    fn provide(&self) -> Result<Vec<Query>>;
}

/// Provider over a fixed set of queries
pub struct StaticQueries(pub Vec<Query>);

impl QueryProvider for StaticQueries {
    fn provide(&self) -> Result<Vec<Query>> {
        Ok(self.0.clone())
    }
}

/// Collects mapping sources and builds a validated query table
#[derive(Clone)]
pub struct QueryMappingLoader {
    paths: Vec<PathBuf>,
    sources: Vec<(String, String)>,
    providers: Vec<Arc<dyn QueryProvider>>,
    default_dialect: String,
}

impl QueryMappingLoader {
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            sources: Vec::new(),
            providers: Vec::new(),
            default_dialect: TEMPLATE_DIALECT.to_string(),
        }
    }

    /// Add a mapping file, or a directory scanned recursively for `*.xml`
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Add an in-memory mapping document
    pub fn with_source(mut self, origin: impl Into<String>, content: impl Into<String>) -> Self {
        self.sources.push((origin.into(), content.into()));
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn QueryProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Dialect assumed for scripts that do not declare one
    pub fn with_default_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.default_dialect = dialect.into();
        self
    }

    fn mapping_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in &self.paths {
            collect_mapping_files(path, &mut files)?;
        }
        Ok(files)
    }

    /// Parse every source and validate the merged table
    pub fn load(&self) -> Result<HashMap<String, Arc<Query>>> {
        let mut queries = Vec::new();

        for file in self.mapping_files()? {
            let origin = file.display().to_string();
            let content = std::fs::read_to_string(&file)
                .map_err(|e| QueryError::Io(format!("Failed to read {}: {}", origin, e)))?;
            let mapping = parse_mapping(&origin, &content, &self.default_dialect)?;
            debug!("Parsed {} queries from {}", mapping.queries.len(), origin);
            queries.extend(mapping.into_queries());
        }

        for (origin, content) in &self.sources {
            let mapping = parse_mapping(origin, content, &self.default_dialect)?;
            queries.extend(mapping.into_queries());
        }

        for provider in &self.providers {
            queries.extend(provider.provide()?);
        }

        build_table(queries)
    }
}

impl Default for QueryMappingLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_mapping_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    if !path.is_dir() {
        return Err(QueryError::Io(format!(
            "Mapping path does not exist: {}",
            path.display()
        )));
    }

    let mut entries = std::fs::read_dir(path)
        .map_err(|e| QueryError::Io(format!("Failed to read {}: {}", path.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            collect_mapping_files(&entry, files)?;
        } else if entry.extension().is_some_and(|ext| ext == "xml") {
            files.push(entry);
        }
    }
    Ok(())
}

/// Merge queries into one table, rejecting duplicates, dangling fetch
/// references and fetch cycles
pub fn build_table(queries: Vec<Query>) -> Result<HashMap<String, Arc<Query>>> {
    let mut table = HashMap::with_capacity(queries.len());
    for query in queries {
        let name = query.versioned_name();
        if table.contains_key(&name) {
            return Err(QueryError::DuplicateQuery(name));
        }
        table.insert(name, Arc::new(query));
    }

    let mut names: Vec<&String> = table.keys().collect();
    names.sort();

    for name in &names {
        for fetch in &table[*name].fetch_queries {
            let reference = fetch.reference_versioned_name();
            if !table.contains_key(&reference) {
                return Err(QueryError::MissingFetchReference {
                    query: (*name).clone(),
                    reference,
                });
            }
        }
    }

    for name in &names {
        if let Some(path) = find_cycle(&table, name) {
            return Err(QueryError::CircularFetch { path });
        }
    }

    Ok(table)
}

/// Breadth-first walk of the fetch references reachable from `start`,
/// returning the path back to `start` if it reappears
fn find_cycle(table: &HashMap<String, Arc<Query>>, start: &str) -> Option<Vec<String>> {
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
    let mut queue: VecDeque<String> = VecDeque::from([start.to_string()]);

    while let Some(current) = queue.pop_front() {
        let Some(query) = table.get(&current) else {
            continue;
        };
        for fetch in &query.fetch_queries {
            let reference = fetch.reference_versioned_name();
            if reference == start {
                let mut path = vec![current.clone()];
                let mut cursor = current.as_str();
                while cursor != start {
                    cursor = parents[cursor].as_str();
                    path.push(cursor.to_string());
                }
                path.reverse();
                path.push(start.to_string());
                return Some(path);
            }
            if visited.insert(reference.clone()) {
                parents.insert(reference.clone(), current.clone());
                queue.push_back(reference);
            }
        }
    }
    None
}

/// One published version of the query table
#[derive(Debug, Default)]
pub struct MappingSnapshot {
    pub generation: u64,
    pub queries: HashMap<String, Arc<Query>>,
}

impl MappingSnapshot {
    pub fn get(&self, name: &str) -> Option<Arc<Query>> {
        self.queries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Owner of the global name to query table.
///
/// Reload builds a complete new table before publishing it; a failed
/// reload leaves the current table in place.
pub struct QueryMappingService {
    loader: QueryMappingLoader,
    current: RwLock<Arc<MappingSnapshot>>,
    generation: AtomicU64,
}

impl QueryMappingService {
    pub fn new(loader: QueryMappingLoader) -> Result<Self> {
        let queries = loader.load()?;
        info!("Loaded {} named queries", queries.len());
        Ok(Self {
            loader,
            current: RwLock::new(Arc::new(MappingSnapshot {
                generation: 0,
                queries,
            })),
            generation: AtomicU64::new(0),
        })
    }

    /// Service over a fixed set of queries
    pub fn from_queries(queries: Vec<Query>) -> Result<Self> {
        Self::new(QueryMappingLoader::new().with_provider(Arc::new(StaticQueries(queries))))
    }

    pub fn snapshot(&self) -> Arc<MappingSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get_query(&self, name: &str) -> Result<Arc<Query>> {
        self.snapshot()
            .get(name)
            .ok_or_else(|| QueryError::QueryNotFound(name.to_string()))
    }

    /// Reload every source and publish the new table
    pub fn reload(&self) -> Result<usize> {
        let queries = match self.loader.load() {
            Ok(queries) => queries,
            Err(e) => {
                error!("Mapping reload failed, keeping current table: {}", e);
                return Err(e);
            }
        };

        let count = queries.len();
        let mut current = self.current.write();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Arc::new(MappingSnapshot {
            generation,
            queries,
        });
        info!("Reloaded {} named queries (generation {})", count, generation);
        Ok(count)
    }
}
