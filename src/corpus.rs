use std::{
    collections::{HashMap, HashSet},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use itertools::Itertools;
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde_derive::{Deserialize, Serialize};

use crate::{
    configuration::CampaignConfig,
    log::log,
    mutation::structural,
    oracle::{BugKind, OracleResult},
    scoring::ScoreRecord,
    syntax::SyntaxTree,
};

const TMP_PREFIX: &str = ".tmp-";
pub const CANDIDATE_FILE: &str = "candidate.rs";
pub const METADATA_FILE: &str = "meta.json";

const INTERNAL_MARKERS: &[&str] = &[
    "rustc_attrs",
    "lang_items",
    "#[rustc_",
    "no_core",
    "\"rust-intrinsic\"",
];

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed metadata in {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no usable seeds under {0}")]
    NoSeeds(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CorpusError + '_ {
    move |source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where a candidate came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent: String,
    /// Id of the initial seed this candidate descends from.
    #[serde(default)]
    pub family: String,
    pub mutator: String,
    pub index: usize,
    pub generation: u32,
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub source: String,
    pub fingerprint: String,
    pub lineage: Lineage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub fingerprint: String,
    pub kind: BugKind,
    pub score: ScoreRecord,
    pub lineage: Lineage,
    pub oracle: OracleResult,
    pub line_count: usize,
    pub found_at: String,
    pub lane: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub hits: u64,
    pub last_seen: String,
    #[serde(default)]
    pub kinds: HashMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PersistOutcome {
    Stored(PathBuf),
    Duplicate { hits: u64 },
}

#[derive(Clone, Debug)]
pub struct Seed {
    pub id: String,
    pub tree: SyntaxTree,
    pub generation: u32,
    pub family: String,
}

impl Seed {
    pub fn initial(id: String, tree: SyntaxTree) -> Seed {
        Seed {
            family: id.clone(),
            id,
            tree,
            generation: 0,
        }
    }
}

/// What the root seed of a family does on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
    Clean,
    Fails(BugKind),
}

/// How initial seeds are drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeedWeighting {
    /// Above 1 flattens the constraint-choice weights, below 1 sharpens them.
    pub temperature: f64,
    pub min_weight: f64,
    /// Chance of drawing from promoted seeds when there are any.
    pub promoted_chance: f64,
    /// Promotions allowed per family; 0 disables promotion.
    pub promotions_per_family: u32,
}

impl Default for SeedWeighting {
    fn default() -> Self {
        SeedWeighting {
            temperature: 2.0,
            min_weight: 1.0,
            promoted_chance: 0.1,
            promotions_per_family: 2,
        }
    }
}

impl From<&CampaignConfig> for SeedWeighting {
    fn from(config: &CampaignConfig) -> Self {
        SeedWeighting {
            temperature: config.seed_weight_temperature,
            min_weight: config.seed_min_weight,
            promoted_chance: config.promoted_pick_chance,
            promotions_per_family: config.promotions_per_family,
        }
    }
}

impl SeedWeighting {
    fn weight(&self, choices: usize, picks: u64, decay: f64) -> f64 {
        let shaped = (choices.max(1) as f64).powf(1.0 / self.temperature);
        let decayed = shaped / (1.0 + picks as f64).powf(decay);
        decayed.max(self.min_weight)
    }
}

struct Pooled {
    seed: Seed,
    choices: usize,
    picks: AtomicU64,
}

impl Pooled {
    fn new(seed: Seed) -> Pooled {
        Pooled {
            choices: structural::constraint_choices(&seed.tree),
            seed,
            picks: AtomicU64::new(0),
        }
    }
}

struct Discovered {
    seed: Seed,
    kind: BugKind,
    score: f64,
    picks: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub loaded: usize,
    pub empty: usize,
    pub internal: usize,
    pub unparseable: usize,
}

fn uses_internal_features(source: &str) -> bool {
    let compact: String = source.chars().filter(|c| !c.is_whitespace()).collect();
    INTERNAL_MARKERS.iter().any(|marker| compact.contains(marker))
}

fn rust_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), CorpusError> {
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_dir() {
            rust_files(&path, found)?;
        } else if path.extension().map_or(false, |e| e == "rs") {
            found.push(path);
        }
    }
    Ok(())
}

/// Loads every `.rs` file below `path`, or the single file `path` names.
pub fn load_seeds(path: &Path, skip_internal: bool) -> Result<(Vec<Seed>, SeedReport), CorpusError> {
    let mut files = vec![];
    if path.is_dir() {
        rust_files(path, &mut files)?;
    } else {
        files.push(path.to_path_buf());
    }
    files.sort();

    let mut report = SeedReport::default();
    let mut seeds = vec![];

    for file in files {
        let source = std::fs::read_to_string(&file).map_err(io_error(&file))?;
        let id = file
            .strip_prefix(path)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .unwrap_or(&file)
            .to_string_lossy()
            .into_owned();

        if source.trim().is_empty() {
            report.empty += 1;
            continue;
        }
        if skip_internal && uses_internal_features(&source) {
            report.internal += 1;
            continue;
        }
        match SyntaxTree::parse(&source) {
            Ok(tree) => seeds.push(Seed::initial(id, tree)),
            Err(e) => {
                log!("skipping seed {id}: {e}");
                report.unparseable += 1;
            }
        }
    }

    report.loaded = seeds.len();
    if seeds.is_empty() {
        return Err(CorpusError::NoSeeds(path.to_path_buf()));
    }
    Ok((seeds, report))
}

/// Initial seeds plus every interesting candidate found so far.
///
/// Entries are directories `corpus/<kind>/<fingerprint>` holding the candidate text and
/// its metadata. They are written once: duplicates only touch `stats/<fingerprint>.json`.
///
/// Initial seeds are grouped in families by the seed a candidate descends from. A family
/// whose root already hangs or crashes, or that produced a hang or crash, is banned
/// from further initial picks.
pub struct Corpus {
    output: PathBuf,
    initial: Vec<Pooled>,
    promoted: Vec<Pooled>,
    discovered: Vec<Discovered>,
    known: HashMap<String, BugKind>,
    counter: AtomicU64,
    discovered_bias: f64,
    pick_decay: f64,
    weighting: SeedWeighting,
    fates: HashMap<String, Fate>,
    banned: HashSet<String>,
    promotions: HashMap<String, u32>,
}

impl Corpus {
    /// Prepares the output tree, drops half-written entries and indexes the rest.
    pub fn open(
        output: &Path,
        initial: Vec<Seed>,
        discovered_bias: f64,
        pick_decay: f64,
    ) -> Result<Corpus, CorpusError> {
        let mut corpus = Corpus {
            output: output.to_path_buf(),
            initial: initial.into_iter().map(Pooled::new).collect(),
            promoted: vec![],
            discovered: vec![],
            known: HashMap::new(),
            counter: AtomicU64::new(0),
            discovered_bias,
            pick_decay,
            weighting: SeedWeighting::default(),
            fates: HashMap::new(),
            banned: HashSet::new(),
            promotions: HashMap::new(),
        };

        for dir in [corpus.corpus_dir(), corpus.stats_dir()] {
            std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }
        corpus.recover()?;
        Ok(corpus)
    }

    pub fn with_weighting(mut self, weighting: SeedWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    fn corpus_dir(&self) -> PathBuf {
        self.output.join("corpus")
    }

    fn stats_dir(&self) -> PathBuf {
        self.output.join("stats")
    }

    pub fn entry_dir(&self, kind: BugKind, fingerprint: &str) -> PathBuf {
        self.corpus_dir().join(kind.dir_name()).join(fingerprint)
    }

    fn recover(&mut self) -> Result<(), CorpusError> {
        let corpus_dir = self.corpus_dir();
        let mut removed = 0;

        for entry in std::fs::read_dir(&corpus_dir).map_err(io_error(&corpus_dir))? {
            let path = entry.map_err(io_error(&corpus_dir))?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if name.starts_with(TMP_PREFIX) {
                std::fs::remove_dir_all(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        if removed > 0 {
            log!("removed {removed} half-written corpus entries");
        }

        for kind in BugKind::INTERESTING {
            let kind_dir = corpus_dir.join(kind.dir_name());
            if !kind_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&kind_dir).map_err(io_error(&kind_dir))? {
                let path = entry.map_err(io_error(&kind_dir))?.path();
                match load_entry(&path) {
                    Ok((metadata, tree)) => self.index(metadata, tree),
                    Err(e) => log!("ignoring corpus entry {}: {e}", path.display()),
                }
            }
        }
        Ok(())
    }

    fn index(&mut self, metadata: EntryMetadata, tree: SyntaxTree) {
        self.known.insert(metadata.fingerprint.clone(), metadata.kind);
        let family = if metadata.lineage.family.is_empty() {
            metadata.lineage.parent
        } else {
            metadata.lineage.family
        };
        self.discovered.push(Discovered {
            seed: Seed {
                id: metadata.fingerprint,
                tree,
                generation: metadata.lineage.generation,
                family,
            },
            kind: metadata.kind,
            score: metadata.score.score,
            picks: AtomicU64::new(0),
        });
    }

    pub fn discovered_len(&self) -> usize {
        self.discovered.len()
    }

    pub fn count(&self, kind: BugKind) -> usize {
        self.discovered.iter().filter(|d| d.kind == kind).count()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.known.contains_key(fingerprint)
    }

    /// A discovered entry with probability `discovered_bias`, weighted by
    /// `score / (1 + picks)^decay`; otherwise an initial seed (see `pick_initial`).
    pub fn pick_seed<R: Rng>(&self, rng: &mut R) -> Option<Seed> {
        let use_discovered = !self.discovered.is_empty()
            && (self.initial.is_empty() || rng.gen_bool(self.discovered_bias));

        if !use_discovered {
            return self.pick_initial(rng);
        }

        let weights = self
            .discovered
            .iter()
            .map(|d| {
                let picks = d.picks.load(Ordering::Relaxed) as f64;
                (d.score.max(0.0) + 1e-3) / (1.0 + picks).powf(self.pick_decay)
            })
            .collect_vec();

        let chosen = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..self.discovered.len()),
        };
        let entry = &self.discovered[chosen];
        entry.picks.fetch_add(1, Ordering::Relaxed);
        Some(entry.seed.clone())
    }

    /// Initial or promoted seed weighted by `max(1, choices)^(1/temperature)`, where
    /// `choices` sums the bounds selectable at every bound injection site. Banned
    /// families are skipped unless nothing else is left.
    fn pick_initial<R: Rng>(&self, rng: &mut R) -> Option<Seed> {
        let pool = if !self.promoted.is_empty() && rng.gen_bool(self.weighting.promoted_chance) {
            &self.promoted
        } else {
            &self.initial
        };
        let mut eligible = pool
            .iter()
            .filter(|p| !self.banned.contains(&p.seed.family))
            .collect_vec();
        if eligible.is_empty() {
            eligible = pool.iter().collect();
        }
        if eligible.is_empty() {
            return None;
        }

        let weights = eligible
            .iter()
            .map(|p| {
                self.weighting
                    .weight(p.choices, p.picks.load(Ordering::Relaxed), self.pick_decay)
            })
            .collect_vec();
        let chosen = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..eligible.len()),
        };
        let entry = eligible[chosen];
        entry.picks.fetch_add(1, Ordering::Relaxed);
        Some(entry.seed.clone())
    }

    /// Root seed of a family, if it is still loaded.
    pub fn family_root(&self, family: &str) -> Option<&Seed> {
        self.initial
            .iter()
            .map(|p| &p.seed)
            .find(|seed| seed.id == family)
    }

    pub fn fate(&self, family: &str) -> Option<Fate> {
        self.fates.get(family).copied()
    }

    pub fn record_fate(&mut self, family: &str, fate: Fate) {
        if let Fate::Fails(kind) = fate {
            log!("seed {family} already fails on its own ({kind})");
        }
        self.fates.insert(family.to_string(), fate);
    }

    pub fn ban_family(&mut self, family: &str) {
        if self.banned.insert(family.to_string()) {
            log!("no further picks from seed family {family}");
        }
    }

    pub fn is_banned(&self, family: &str) -> bool {
        self.banned.contains(family)
    }

    /// Adds a well-formed variant to the promoted pool, at most
    /// `promotions_per_family` per family.
    pub fn promote(&mut self, seed: Seed) -> bool {
        let promoted = self.promotions.entry(seed.family.clone()).or_insert(0);
        if *promoted >= self.weighting.promotions_per_family {
            return false;
        }
        let fingerprint = seed.tree.fingerprint();
        if self.promoted.iter().any(|p| p.seed.tree.fingerprint() == fingerprint) {
            return false;
        }
        *promoted += 1;
        self.promoted.push(Pooled::new(seed));
        true
    }

    pub fn promoted_len(&self) -> usize {
        self.promoted.len()
    }

    /// First writer wins: a known fingerprint only bumps its statistics sidecar.
    pub fn persist(
        &mut self,
        candidate: &Candidate,
        metadata: &EntryMetadata,
    ) -> Result<PersistOutcome, CorpusError> {
        if self.known.contains_key(&candidate.fingerprint) {
            return self.record_duplicate(&candidate.fingerprint, metadata.kind);
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self.corpus_dir().join(format!(
            "{TMP_PREFIX}{}-{}-{n}",
            candidate.fingerprint,
            std::process::id()
        ));
        std::fs::create_dir_all(&tmp).map_err(io_error(&tmp))?;

        let metadata_json = serde_json::to_string_pretty(metadata).map_err(|source| {
            CorpusError::Metadata {
                path: tmp.clone(),
                source,
            }
        })?;
        write_synced(&tmp.join(CANDIDATE_FILE), candidate.source.as_bytes())?;
        write_synced(&tmp.join(METADATA_FILE), metadata_json.as_bytes())?;

        let target = self.entry_dir(metadata.kind, &candidate.fingerprint);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        if target.exists() || std::fs::rename(&tmp, &target).is_err() {
            // another process got there first
            std::fs::remove_dir_all(&tmp).map_err(io_error(&tmp))?;
            self.known.insert(candidate.fingerprint.clone(), metadata.kind);
            return self.record_duplicate(&candidate.fingerprint, metadata.kind);
        }

        let tree = SyntaxTree::parse(&candidate.source).ok();
        if let Some(tree) = tree {
            self.index(metadata.clone(), tree);
        } else {
            self.known.insert(candidate.fingerprint.clone(), metadata.kind);
        }
        Ok(PersistOutcome::Stored(target))
    }

    fn record_duplicate(&self, fingerprint: &str, kind: BugKind) -> Result<PersistOutcome, CorpusError> {
        let path = self.stats_dir().join(format!("{fingerprint}.json"));

        let mut stats: DuplicateStats = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log!("resetting unreadable duplicate stats {}: {e}", path.display());
                DuplicateStats::default()
            }),
            Err(_) => DuplicateStats::default(),
        };
        stats.hits += 1;
        stats.last_seen = chrono::Local::now().to_rfc3339();
        *stats.kinds.entry(kind.dir_name().to_string()).or_insert(0) += 1;

        let text = serde_json::to_string_pretty(&stats).map_err(|source| CorpusError::Metadata {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(io_error(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_error(&path))?;

        Ok(PersistOutcome::Duplicate { hits: stats.hits })
    }
}

fn write_synced(path: &Path, content: &[u8]) -> Result<(), CorpusError> {
    let mut file = std::fs::File::create(path).map_err(io_error(path))?;
    file.write_all(content).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))
}

/// Reads an entry directory back.
pub fn load_entry(dir: &Path) -> Result<(EntryMetadata, SyntaxTree), anyhow::Error> {
    let metadata_path = dir.join(METADATA_FILE);
    let metadata: EntryMetadata = serde_json::from_str(
        &std::fs::read_to_string(&metadata_path).context("reading entry metadata")?,
    )
    .context("parsing entry metadata")?;

    let source = std::fs::read_to_string(dir.join(CANDIDATE_FILE)).context("reading entry source")?;
    let tree = SyntaxTree::parse(&source).context("parsing entry source")?;
    Ok((metadata, tree))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::execution::{ExitStatus, ProcessOutcome};

    pub fn metadata(fingerprint: &str, kind: BugKind, score: f64) -> EntryMetadata {
        let outcome = ProcessOutcome {
            status: ExitStatus::Code { code: 0 },
            stderr: String::new(),
            elapsed: Duration::from_millis(1),
        };
        EntryMetadata {
            fingerprint: fingerprint.to_string(),
            kind,
            score: ScoreRecord {
                score,
                ..ScoreRecord::default()
            },
            lineage: Lineage {
                parent: "seed.rs".to_string(),
                family: "seed.rs".to_string(),
                mutator: "add_trait".to_string(),
                index: 0,
                generation: 1,
            },
            oracle: OracleResult {
                baseline: outcome.clone(),
                divergence: Some(outcome),
            },
            line_count: 1,
            found_at: "now".to_string(),
            lane: 0,
        }
    }

    fn candidate(source: &str) -> Candidate {
        let tree = SyntaxTree::parse(source).unwrap();
        Candidate {
            source: tree.render(),
            fingerprint: tree.fingerprint(),
            lineage: metadata("", BugKind::Hang, 0.0).lineage,
        }
    }

    fn seed(source: &str) -> Seed {
        Seed::initial(source.to_string(), SyntaxTree::parse(source).unwrap())
    }

    #[test]
    fn first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![], 0.5, 0.5).unwrap();
        let hang = candidate("fn main() { loop {} }");

        let stored = corpus
            .persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 3.0))
            .unwrap();
        let PersistOutcome::Stored(path) = stored else {
            panic!("first write was not stored");
        };
        assert_eq!(path, dir.path().join("corpus/hang").join(&hang.fingerprint));
        assert!(path.join(CANDIDATE_FILE).exists());
        assert!(path.join(METADATA_FILE).exists());

        let again = corpus
            .persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 9.0))
            .unwrap();
        assert_eq!(again, PersistOutcome::Duplicate { hits: 1 });
        let again = corpus
            .persist(&hang, &metadata(&hang.fingerprint, BugKind::Ice, 9.0))
            .unwrap();
        assert_eq!(again, PersistOutcome::Duplicate { hits: 2 });

        let (stored_meta, _) = load_entry(&path).unwrap();
        assert_eq!(stored_meta.score.score, 3.0);
        assert_eq!(corpus.discovered_len(), 1);
    }

    #[test]
    fn recovery_drops_partial_entries_and_reindexes() {
        let dir = tempfile::tempdir().unwrap();
        let hang = candidate("fn main() { loop {} }");
        {
            let mut corpus = Corpus::open(dir.path(), vec![], 0.5, 0.5).unwrap();
            corpus
                .persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 3.0))
                .unwrap();
        }
        let partial = dir.path().join("corpus/.tmp-abc-1-0");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join(CANDIDATE_FILE), "fn").unwrap();

        let mut corpus = Corpus::open(dir.path(), vec![], 0.5, 0.5).unwrap();

        assert!(!partial.exists());
        assert!(corpus.contains(&hang.fingerprint));
        assert_eq!(corpus.count(BugKind::Hang), 1);
        assert!(matches!(
            corpus.persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 1.0)),
            Ok(PersistOutcome::Duplicate { .. })
        ));
    }

    #[test]
    fn seed_picks_prefer_discovered_entries_when_biased() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![seed("fn main() {}")], 1.0, 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        assert_eq!(corpus.pick_seed(&mut rng).unwrap().id, "fn main() {}");

        let found = candidate("trait T {}");
        corpus
            .persist(&found, &metadata(&found.fingerprint, BugKind::Ice, 5.0))
            .unwrap();

        for _ in 0..10 {
            assert_eq!(corpus.pick_seed(&mut rng).unwrap().id, found.fingerprint);
        }
    }

    #[test]
    fn repeated_picks_lose_weight() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![], 1.0, 1.0).unwrap();
        let strong = candidate("trait A {}");
        let weak = candidate("trait B {}");
        corpus
            .persist(&strong, &metadata(&strong.fingerprint, BugKind::Ice, 10.0))
            .unwrap();
        corpus
            .persist(&weak, &metadata(&weak.fingerprint, BugKind::Ice, 1.0))
            .unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        let weak_picks = (0..2000)
            .filter(|_| corpus.pick_seed(&mut rng).unwrap().id == weak.fingerprint)
            .count();

        // without smoothing the weak entry would get about 1 pick in 11
        assert!(weak_picks > 2000 / 11);
    }

    #[test]
    fn seeds_load_recursively_and_skip_noise() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        std::fs::write(nested.join("b.rs"), "trait T {}").unwrap();
        std::fs::write(nested.join("empty.rs"), "  \n").unwrap();
        std::fs::write(nested.join("internal.rs"), "#![feature(rustc_attrs)]\nfn main() {}").unwrap();
        std::fs::write(nested.join("broken.rs"), "fn main( {").unwrap();
        std::fs::write(nested.join("notes.txt"), "fn main() {}").unwrap();

        let (seeds, report) = load_seeds(dir.path(), true).unwrap();

        assert_eq!(seeds.iter().map(|s| s.id.as_str()).collect_vec(), ["a.rs", "nested/b.rs"]);
        assert_eq!(
            report,
            SeedReport {
                loaded: 2,
                empty: 1,
                internal: 1,
                unparseable: 1
            }
        );

        let (seeds, _) = load_seeds(dir.path(), false).unwrap();
        assert_eq!(seeds.len(), 3);
    }

    #[test]
    fn empty_seed_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_seeds(dir.path(), true), Err(CorpusError::NoSeeds(_))));
    }

    #[test]
    fn seeds_with_more_bound_choices_are_picked_more() {
        let dir = tempfile::tempdir().unwrap();
        let rich = "trait A {} trait B {} trait C {} fn f<T, U, V>(x: T) {}";
        let corpus = Corpus::open(dir.path(), vec![seed("fn main() {}"), seed(rich)], 0.0, 0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let rich_picks = (0..2000)
            .filter(|_| corpus.pick_seed(&mut rng).unwrap().id == rich)
            .count();

        // 63 choices against none: weights of about 7.9 and 1
        assert!(rich_picks > 1600);
    }

    #[test]
    fn banned_families_are_skipped_until_nothing_is_left() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![seed("fn a() {}"), seed("fn b() {}")], 0.0, 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(9);

        corpus.ban_family("fn a() {}");
        for _ in 0..20 {
            assert_eq!(corpus.pick_seed(&mut rng).unwrap().family, "fn b() {}");
        }

        corpus.ban_family("fn b() {}");
        assert!(corpus.pick_seed(&mut rng).is_some());
    }

    #[test]
    fn promotions_are_capped_per_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![seed("fn main() {}")], 0.0, 0.5)
            .unwrap()
            .with_weighting(SeedWeighting {
                promoted_chance: 1.0,
                ..SeedWeighting::default()
            });
        let variant = |source: &str| Seed {
            family: "fn main() {}".to_string(),
            generation: 1,
            ..seed(source)
        };

        assert!(corpus.promote(variant("fn main() {} trait A {}")));
        assert!(!corpus.promote(variant("fn main() {} trait A {}")));
        assert!(corpus.promote(variant("fn main() {} trait B {}")));
        assert!(!corpus.promote(variant("fn main() {} trait C {}")));
        assert_eq!(corpus.promoted_len(), 2);

        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(corpus.pick_seed(&mut rng).unwrap().generation, 1);
    }

    #[test]
    fn unreadable_duplicate_stats_are_reset_with_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut corpus = Corpus::open(dir.path(), vec![], 0.5, 0.5).unwrap();
        let hang = candidate("fn main() { loop { } }");
        corpus
            .persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 3.0))
            .unwrap();
        let stats = dir.path().join("stats").join(format!("{}.json", hang.fingerprint));
        std::fs::write(&stats, "{ not json").unwrap();

        let again = corpus
            .persist(&hang, &metadata(&hang.fingerprint, BugKind::Hang, 3.0))
            .unwrap();

        assert_eq!(again, PersistOutcome::Duplicate { hits: 1 });
        let expected = format!("resetting unreadable duplicate stats {}", stats.display());
        assert!(crate::log::pull_messages(4096).iter().any(|m| m.contains(&expected)));
    }
}
