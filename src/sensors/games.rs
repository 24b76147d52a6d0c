//! Running-game detection.
//!
//! Snapshots the process set and tests each executable name against the
//! configured patterns. The lowered patterns are cached and rebuilt only
//! when the config store's games version changes; readers take the shared
//! lock. Patterns are kept sorted so that ties between overlapping patterns
//! resolve deterministically to the lexicographically first one.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::ConfigStore;
use crate::os::process;

/// Sensor value when no configured game is running
pub const NO_GAME: &str = "none";

/// A lowered pattern and the game it identifies
#[derive(Debug, Clone, PartialEq, Eq)]
struct GamePattern {
    pattern: String,
    game_id: String,
}

struct PatternCache {
    version: u64,
    patterns: Arc<Vec<GamePattern>>,
}

/// Detects the first configured game among the running processes.
pub struct GameScanner {
    store: Arc<ConfigStore>,
    cache: RwLock<PatternCache>,
}

impl GameScanner {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(PatternCache {
                version: 0,
                patterns: Arc::new(Vec::new()),
            }),
        }
    }

    /// Current pattern set, rebuilt only when the store version changed.
    fn patterns(&self) -> Arc<Vec<GamePattern>> {
        let (games, version) = self.store.game_map();

        {
            let cache = self.cache.read();
            if cache.version == version {
                return Arc::clone(&cache.patterns);
            }
        }

        let mut cache = self.cache.write();
        // Another reader may have rebuilt while we waited for the lock.
        if cache.version == version {
            return Arc::clone(&cache.patterns);
        }

        let mut patterns: Vec<GamePattern> = games
            .iter()
            .map(|(pattern, game_id)| GamePattern {
                pattern: pattern.to_lowercase(),
                game_id: game_id.clone(),
            })
            .collect();
        patterns.sort_by(|a, b| {
            a.pattern
                .cmp(&b.pattern)
                .then_with(|| a.game_id.cmp(&b.game_id))
        });

        debug!(
            "Rebuilt game pattern cache: {} patterns (version {version})",
            patterns.len()
        );
        cache.version = version;
        cache.patterns = Arc::new(patterns);
        Arc::clone(&cache.patterns)
    }

    /// Identifier of the first matching running game, or [`NO_GAME`].
    ///
    /// Degrades to [`NO_GAME`] when the process snapshot fails.
    pub fn running_game(&self) -> String {
        let patterns = self.patterns();
        if patterns.is_empty() {
            return NO_GAME.to_string();
        }

        let found = process::find_map(|name| {
            match_game(name.as_str(), name.base_name(), &patterns)
        });

        match found {
            Ok(Some(game_id)) => game_id,
            Ok(None) => NO_GAME.to_string(),
            Err(e) => {
                warn!("Process snapshot failed: {e}");
                NO_GAME.to_string()
            }
        }
    }
}

/// A pattern matches when the process name starts with it, or the
/// suffix-stripped base name equals it.
fn match_game(name: &str, base_name: &str, patterns: &[GamePattern]) -> Option<String> {
    patterns
        .iter()
        .find(|p| name.starts_with(&p.pattern) || base_name == p.pattern)
        .map(|p| p.game_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use std::collections::HashMap;
    use std::io::Write;

    fn patterns(entries: &[(&str, &str)]) -> Vec<GamePattern> {
        let mut v: Vec<GamePattern> = entries
            .iter()
            .map(|(p, g)| GamePattern {
                pattern: p.to_lowercase(),
                game_id: g.to_string(),
            })
            .collect();
        v.sort_by(|a, b| a.pattern.cmp(&b.pattern).then_with(|| a.game_id.cmp(&b.game_id)));
        v
    }

    fn store_with_games(games: &[(&str, &str)]) -> (tempfile::TempDir, Arc<ConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let games: HashMap<&str, &str> = games.iter().copied().collect();
        let doc = serde_json::json!({ "device_name": "test-pc", "games": games });
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(doc.to_string().as_bytes()).unwrap();
        let store = Arc::new(ConfigStore::load(path).unwrap());
        (dir, store)
    }

    #[test]
    fn test_prefix_match_on_lowered_pattern() {
        let pats = patterns(&[("fortnite", "fortnite_game")]);
        assert_eq!(
            match_game(
                "fortniteclient-win64-shipping.exe",
                "fortniteclient-win64-shipping",
                &pats
            ),
            Some("fortnite_game".to_string())
        );
    }

    #[test]
    fn test_base_name_equality_match() {
        let pats = patterns(&[("javaw", "minecraft")]);
        assert_eq!(
            match_game("javaw.exe", "javaw", &pats),
            Some("minecraft".to_string())
        );
        assert_eq!(match_game("javawhatever", "javawhatever", &pats), Some("minecraft".to_string()));
    }

    #[test]
    fn test_no_match_returns_none() {
        let pats = patterns(&[("r5apex", "apex")]);
        assert_eq!(match_game("notepad.exe", "notepad", &pats), None);
    }

    #[test]
    fn test_tie_resolves_to_first_sorted_pattern() {
        // Both patterns match; "cs" sorts before "cs2" so it wins.
        let pats = patterns(&[("cs2", "counter_strike_2"), ("cs", "counter_strike")]);
        assert_eq!(
            match_game("cs2.exe", "cs2", &pats),
            Some("counter_strike".to_string())
        );
    }

    #[test]
    fn test_cache_is_reference_stable_until_version_changes() {
        let (_dir, store) = store_with_games(&[("fortnite", "fortnite_game")]);
        let scanner = GameScanner::new(store.clone());

        let first = scanner.patterns();
        let second = scanner.patterns();
        assert!(Arc::ptr_eq(&first, &second));

        store.reload_games();
        let third = scanner.patterns();
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(*second, *third);
    }

    #[test]
    fn test_cache_rebuild_picks_up_new_games() {
        let (dir, store) = store_with_games(&[("fortnite", "fortnite_game")]);
        let scanner = GameScanner::new(store.clone());
        assert_eq!(scanner.patterns().len(), 1);

        let doc = serde_json::json!({
            "device_name": "test-pc",
            "games": { "fortnite": "fortnite_game", "r5apex": "apex" }
        });
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), doc.to_string()).unwrap();
        store.reload_games();

        let pats = scanner.patterns();
        assert_eq!(pats.len(), 2);
        assert!(pats.iter().any(|p| p.game_id == "apex"));
    }

    #[test]
    fn test_running_game_with_empty_patterns_is_none() {
        let (_dir, store) = store_with_games(&[]);
        let scanner = GameScanner::new(store);
        assert_eq!(scanner.running_game(), NO_GAME);
    }
}
