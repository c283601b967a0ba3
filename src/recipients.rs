//! Recipient resolution: fetch candidate NFDs, filter out the ineligible,
//! optionally sample, derive destinations, de-duplicate and sort.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::config::DestinationChoice;
use crate::directory::eligibility::{
    is_contract_version_at_least, is_vault_opt_in_locked_for, MIN_VAULT_VERSION,
};
use crate::directory::{DirectoryClient, SearchQuery, View};
use crate::error::ResolveError;
use crate::model::{CandidateRecord, Recipient};
use crate::retry::retry_directory_call;

/// Records requested per search page.
pub const PAGE_SIZE: u32 = 200;

/// What happened to the candidates on the way to the final list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub fetched: usize,
    pub no_destination: usize,
    pub below_min_version: usize,
    pub vault_locked: usize,
    pub unverified: usize,
    pub not_sampled: usize,
    pub self_sends: usize,
    pub duplicates_collapsed: usize,
}

impl fmt::Display for ResolutionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {}, no destination {}, old contract {}, vault locked {}, unverified {}, not sampled {}, self {}, duplicates {}",
            self.fetched,
            self.no_destination,
            self.below_min_version,
            self.vault_locked,
            self.unverified,
            self.not_sampled,
            self.self_sends,
            self.duplicates_collapsed
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub recipients: Vec<Recipient>,
    pub stats: ResolutionStats,
}

pub struct RecipientResolver {
    directory: Arc<dyn DirectoryClient>,
    destination: DestinationChoice,
    sender: String,
    source_vault_account: Option<String>,
}

impl RecipientResolver {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        destination: DestinationChoice,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            destination,
            sender: sender.into(),
            source_vault_account: None,
        }
    }

    /// Sending from this vault account; it is never picked as a destination.
    pub fn with_source_vault(mut self, vault_account: impl Into<String>) -> Self {
        self.source_vault_account = Some(vault_account.into());
        self
    }

    fn view(&self) -> View {
        if self.destination.verified_requirements.is_empty() {
            View::Brief
        } else {
            View::Full
        }
    }

    pub async fn resolve(&self) -> Result<Resolution, ResolveError> {
        let now = chrono::Utc::now().timestamp();
        let candidates = self.fetch_candidates().await?;
        let resolution = self.build(candidates, now, &mut rand::thread_rng());
        info!(
            recipients = resolution.recipients.len(),
            stats = %resolution.stats,
            "Resolved recipients"
        );
        Ok(resolution)
    }

    async fn fetch_candidates(&self) -> Result<Vec<CandidateRecord>, ResolveError> {
        if let Some(csv) = self.destination.csv_file() {
            let names = read_csv_names(csv)?;
            info!(count = names.len(), file = %csv.display(), "Fetching NFDs listed in csv");
            return self.fetch_named(&names).await;
        }
        if let Some(root) = self.destination.segments_of_root() {
            let root_record = retry_directory_call(|| self.directory.get_record(root, View::Brief))
                .await
                .map_err(|source| ResolveError::Directory {
                    what: root.to_string(),
                    source,
                })?;
            info!(root, app_id = root_record.app_id, "Fetching segments of root");
            return self.fetch_pages(Some(root_record.app_id)).await;
        }
        self.fetch_pages(None).await
    }

    async fn fetch_named(&self, names: &[String]) -> Result<Vec<CandidateRecord>, ResolveError> {
        let view = self.view();
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let record = retry_directory_call(|| self.directory.get_record(name, view))
                .await
                .map_err(|source| ResolveError::Directory {
                    what: name.clone(),
                    source,
                })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Page through owned records until an empty page comes back.
    async fn fetch_pages(&self, parent_app_id: Option<u64>) -> Result<Vec<CandidateRecord>, ResolveError> {
        let mut records = Vec::new();
        let mut offset = 0u64;
        loop {
            let query = SearchQuery {
                parent_app_id,
                only_roots: self.destination.only_roots,
                view: self.view(),
                limit: PAGE_SIZE,
                offset,
            };
            let page = retry_directory_call(|| self.directory.search(&query))
                .await
                .map_err(|source| ResolveError::Directory {
                    what: format!("search page at offset {}", offset),
                    source,
                })?;
            if page.is_empty() {
                break;
            }
            debug!(offset, count = page.len(), "Fetched search page");
            records.extend(page);
            offset += u64::from(PAGE_SIZE);
        }
        Ok(records)
    }

    /// Everything after fetching. Pure apart from the random sample.
    pub fn build<R: Rng + ?Sized>(
        &self,
        candidates: Vec<CandidateRecord>,
        now: i64,
        rng: &mut R,
    ) -> Resolution {
        let mut stats = ResolutionStats {
            fetched: candidates.len(),
            ..Default::default()
        };

        let eligible: Vec<CandidateRecord> = candidates
            .into_iter()
            .filter(|record| self.is_eligible(record, now, &mut stats))
            .collect();

        let sampled = match self.destination.max_recipients() {
            Some(max) if max < eligible.len() => {
                info!(max, of = eligible.len(), "Choosing random NFDs");
                stats.not_sampled = eligible.len() - max;
                eligible.choose_multiple(rng, max).cloned().collect()
            }
            _ => eligible,
        };

        let derived: Vec<Recipient> = sampled
            .iter()
            .filter_map(|record| {
                let recipient = self.derive(record);
                if recipient.is_none() {
                    stats.self_sends += 1;
                }
                recipient
            })
            .collect();

        let mut recipients = if self.destination.allow_duplicate_accounts {
            derived
        } else {
            let before = derived.len();
            let unique = dedup_by_owner(derived);
            stats.duplicates_collapsed = before - unique.len();
            unique
        };
        recipients.sort_by(|a, b| {
            a.destination_account
                .cmp(&b.destination_account)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });

        Resolution { recipients, stats }
    }

    fn is_eligible(&self, record: &CandidateRecord, now: i64, stats: &mut ResolutionStats) -> bool {
        let to_vault = self.destination.send_to_vaults;
        let destination = if to_vault {
            &record.nfd_account
        } else {
            &record.deposit_account
        };
        if destination.is_empty() {
            stats.no_destination += 1;
            return false;
        }

        if to_vault {
            let (major, minor) = MIN_VAULT_VERSION;
            let version_ok = record
                .protocol_version()
                .is_some_and(|v| is_contract_version_at_least(v, major, minor));
            if !version_ok {
                stats.below_min_version += 1;
                return false;
            }
            if is_vault_opt_in_locked_for(record, &self.sender, now) {
                stats.vault_locked += 1;
                return false;
            }
        }

        let verified = self
            .destination
            .verified_requirements
            .iter()
            .all(|key| record.has_verified(key));
        if !verified {
            stats.unverified += 1;
            return false;
        }
        true
    }

    fn derive(&self, record: &CandidateRecord) -> Option<Recipient> {
        let to_vault = self.destination.send_to_vaults;
        let destination = if to_vault {
            record.nfd_account.clone()
        } else {
            record.deposit_account.clone()
        };
        if to_vault && self.source_vault_account.as_deref() == Some(destination.as_str()) {
            return None;
        }
        Some(Recipient {
            display_name: record.name.clone(),
            owner_account: record.owner.clone(),
            destination_account: destination,
            destination_is_vault: to_vault,
        })
    }
}

/// One recipient per owner account, the last one seen wins.
fn dedup_by_owner(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut by_owner: HashMap<String, Recipient> = HashMap::with_capacity(recipients.len());
    for recipient in recipients {
        by_owner.insert(recipient.owner_account.clone(), recipient);
    }
    by_owner.into_values().collect()
}

/// Names from the `name` (or `nfd`) column of a csv file, header matched case-insensitively.
pub fn read_csv_names(path: &Path) -> Result<Vec<String>, ResolveError> {
    let csv_error = |message: String| ResolveError::Csv {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(e.to_string()))?;
    let headers = reader.headers().map_err(|e| csv_error(e.to_string()))?.clone();
    if headers.is_empty() {
        return Err(csv_error("file is empty".into()));
    }
    let column = headers
        .iter()
        .position(|h| {
            let h = h.trim();
            h.eq_ignore_ascii_case("name") || h.eq_ignore_ascii_case("nfd")
        })
        .ok_or_else(|| csv_error("neither a 'name' nor an 'nfd' column found".into()))?;

    let mut names = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| csv_error(e.to_string()))?;
        if let Some(name) = row.get(column).map(str::trim).filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Write resolved recipients for review.
pub fn write_recipients_csv(path: &Path, recipients: &[Recipient]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["name", "owner", "destination", "vault"])?;
    for recipient in recipients {
        writer.write_record([
            recipient.display_name.as_str(),
            recipient.owner_account.as_str(),
            recipient.destination_account.as_str(),
            if recipient.destination_is_vault { "true" } else { "false" },
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::error::DirectoryError;
    use crate::testing::{record, FakeDirectory};

    const NOW: i64 = 1_700_000_000;

    fn resolver(directory: Arc<FakeDirectory>, destination: DestinationChoice) -> RecipientResolver {
        RecipientResolver::new(directory, destination, "SENDER")
    }

    fn numbered(count: usize) -> Vec<CandidateRecord> {
        (0..count)
            .map(|i| {
                record(
                    &format!("n{:03}.algo", i),
                    &format!("OWNER{:03}", i),
                    &format!("DEP{:03}", i),
                    &format!("VAULT{:03}", i),
                )
            })
            .collect()
    }

    fn build(destination: DestinationChoice, candidates: Vec<CandidateRecord>) -> Resolution {
        resolver(Arc::new(FakeDirectory::default()), destination).build(
            candidates,
            NOW,
            &mut StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn test_random_count_at_or_above_size_keeps_everyone() {
        for count in [5, 6, 100] {
            let destination = DestinationChoice {
                random_count: Some(count),
                ..Default::default()
            };
            let resolution = build(destination, numbered(5));
            assert_eq!(resolution.recipients.len(), 5);
            assert_eq!(resolution.stats.not_sampled, 0);
        }
    }

    #[test]
    fn test_random_sample_is_distinct_subset() {
        let destination = DestinationChoice {
            random_count: Some(7),
            ..Default::default()
        };
        let resolution = build(destination, numbered(50));
        assert_eq!(resolution.recipients.len(), 7);
        let distinct: HashSet<_> = resolution
            .recipients
            .iter()
            .map(|r| r.destination_account.clone())
            .collect();
        assert_eq!(distinct.len(), 7);
        assert!(distinct.iter().all(|d| d.starts_with("DEP")));
        assert_eq!(resolution.stats.not_sampled, 43);
    }

    #[test]
    fn test_sampling_covers_the_eligible_set() {
        let r = resolver(
            Arc::new(FakeDirectory::default()),
            DestinationChoice {
                random_count: Some(2),
                ..Default::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(99);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            for recipient in r.build(numbered(10), NOW, &mut rng).recipients {
                seen.insert(recipient.display_name);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_dedup_by_owner() {
        let mut candidates = numbered(3);
        for c in candidates.iter_mut() {
            c.owner = "SAME".into();
        }
        let resolution = build(DestinationChoice::default(), candidates.clone());
        assert_eq!(resolution.recipients.len(), 1);
        assert_eq!(resolution.stats.duplicates_collapsed, 2);

        let allowed = DestinationChoice {
            allow_duplicate_accounts: true,
            ..Default::default()
        };
        assert_eq!(build(allowed, candidates).recipients.len(), 3);
    }

    #[test]
    fn test_self_vault_excluded() {
        let destination = DestinationChoice {
            send_to_vaults: true,
            ..Default::default()
        };
        let r = resolver(Arc::new(FakeDirectory::default()), destination).with_source_vault("VAULT001");
        let resolution = r.build(numbered(3), NOW, &mut StdRng::seed_from_u64(1));
        assert_eq!(resolution.recipients.len(), 2);
        assert!(resolution
            .recipients
            .iter()
            .all(|r| r.destination_account != "VAULT001" && r.destination_is_vault));
        assert_eq!(resolution.stats.self_sends, 1);
    }

    #[test]
    fn test_vault_filters() {
        let mut candidates = numbered(4);
        candidates[0]
            .properties
            .internal
            .insert("ver".into(), "2.9".into());
        candidates[1]
            .properties
            .internal
            .insert("vaultOptInLocked".into(), "1".into());
        // locked, but SENDER owns it
        candidates[2].owner = "SENDER".into();
        candidates[2]
            .properties
            .internal
            .insert("vaultOptInLocked".into(), "1".into());
        candidates[3].nfd_account.clear();

        let destination = DestinationChoice {
            send_to_vaults: true,
            ..Default::default()
        };
        let resolution = build(destination, candidates);
        assert_eq!(resolution.recipients.len(), 1);
        assert_eq!(resolution.recipients[0].display_name, "n002.algo");
        assert_eq!(resolution.stats.below_min_version, 1);
        assert_eq!(resolution.stats.vault_locked, 1);
        assert_eq!(resolution.stats.no_destination, 1);
    }

    #[test]
    fn test_verified_requirements_apply_to_unverified_records() {
        let mut candidates = numbered(3);
        candidates[0]
            .properties
            .verified
            .insert("twitter".into(), "a".into());
        candidates[1]
            .properties
            .verified
            .insert("discord".into(), "b".into());
        let destination = DestinationChoice {
            verified_requirements: vec!["twitter".into()],
            ..Default::default()
        };
        let resolution = build(destination, candidates);
        assert_eq!(resolution.recipients.len(), 1);
        assert_eq!(resolution.recipients[0].display_name, "n000.algo");
        assert_eq!(resolution.stats.unverified, 2);
    }

    #[test]
    fn test_sorted_by_destination() {
        let mut candidates = numbered(3);
        candidates.reverse();
        let resolution = build(DestinationChoice::default(), candidates);
        let destinations: Vec<_> = resolution
            .recipients
            .iter()
            .map(|r| r.destination_account.as_str())
            .collect();
        assert_eq!(destinations, vec!["DEP000", "DEP001", "DEP002"]);
    }

    #[tokio::test]
    async fn test_paginates_until_empty_page() {
        let directory = Arc::new(FakeDirectory::default());
        for candidate in numbered(450) {
            directory.add_root(candidate);
        }
        let resolution = resolver(directory.clone(), DestinationChoice::default())
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolution.recipients.len(), 450);

        let offsets: Vec<u64> = directory.searches().iter().map(|q| q.offset).collect();
        assert_eq!(offsets, vec![0, 200, 400, 600]);
        assert!(directory.searches().iter().all(|q| q.limit == PAGE_SIZE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_fetch_retried_after_rate_limit() {
        let directory = Arc::new(FakeDirectory::default());
        for candidate in numbered(3) {
            directory.add_root(candidate);
        }
        directory.fail_next(DirectoryError::RateLimited { secs_remaining: 2 });
        directory.fail_next(DirectoryError::Transient("reset".into()));
        let resolution = resolver(directory, DestinationChoice::default())
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolution.recipients.len(), 3);
    }

    #[tokio::test]
    async fn test_api_error_fails_resolution() {
        let directory = Arc::new(FakeDirectory::default());
        directory.fail_next(DirectoryError::Api {
            message: "bad query".into(),
        });
        let err = resolver(directory, DestinationChoice::default())
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Directory { .. }));
    }

    #[tokio::test]
    async fn test_segments_of_root_scoped_search() {
        let directory = Arc::new(FakeDirectory::default());
        let mut root = record("orange.algo", "ROOTOWNER", "ROOTDEP", "ROOTVAULT");
        root.app_id = 77;
        directory.add_root(root);
        for candidate in numbered(2) {
            directory.add_segment(77, candidate);
        }
        let destination = DestinationChoice {
            segments_of_root: "orange.algo".into(),
            ..Default::default()
        };
        let resolution = resolver(directory.clone(), destination)
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolution.recipients.len(), 2);
        assert!(directory
            .searches()
            .iter()
            .all(|q| q.parent_app_id == Some(77)));
    }

    #[tokio::test]
    async fn test_csv_names_fetched_with_full_view() {
        let dir = tempfile::TempDir::new().unwrap();
        let csv = dir.path().join("list.csv");
        fs::write(&csv, "Id,NFD\n1,n000.algo\n2,n001.algo\n3,\n").unwrap();

        let directory = Arc::new(FakeDirectory::default());
        let mut candidates = numbered(3);
        for c in candidates.iter_mut() {
            c.properties.verified.insert("twitter".into(), "x".into());
        }
        for c in candidates {
            directory.add_root(c);
        }
        let destination = DestinationChoice {
            csv_file: csv.display().to_string(),
            verified_requirements: vec!["twitter".into()],
            ..Default::default()
        };
        let resolution = resolver(directory.clone(), destination)
            .resolve()
            .await
            .unwrap();
        assert_eq!(resolution.recipients.len(), 2);
        assert!(directory.searches().is_empty());
        assert_eq!(directory.fetched_views(), vec![View::Full, View::Full]);
    }

    #[test]
    fn test_csv_without_name_column() {
        let dir = tempfile::TempDir::new().unwrap();
        let csv = dir.path().join("bad.csv");
        fs::write(&csv, "account,amount\nA,1\n").unwrap();
        assert!(matches!(read_csv_names(&csv), Err(ResolveError::Csv { .. })));

        let empty = dir.path().join("empty.csv");
        fs::write(&empty, "").unwrap();
        assert!(matches!(read_csv_names(&empty), Err(ResolveError::Csv { .. })));
    }

    #[test]
    fn test_write_recipients_csv() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let resolution = build(DestinationChoice::default(), numbered(2));
        write_recipients_csv(&path, &resolution.recipients).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "name,owner,destination,vault");
        assert_eq!(lines[1], "n000.algo,OWNER000,DEP000,false");
        assert_eq!(lines.len(), 3);
    }
}
