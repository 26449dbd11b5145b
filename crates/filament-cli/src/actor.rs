//! Actor identity resolution for CLI commands.
//!
//! Chain: `--actor` flag > `FILAMENT_ACTOR` env > user config `actor`.
//! The kind follows the same chain (`--actor-kind`, `FILAMENT_ACTOR_KIND`,
//! user config) and defaults to `human`. Mutating commands need an actor;
//! read-only commands never ask.

use std::env;

use filament_core::config::UserConfig;
use filament_core::model::{Actor, ActorKind};

pub const ACTOR_ENV: &str = "FILAMENT_ACTOR";
pub const ACTOR_KIND_ENV: &str = "FILAMENT_ACTOR_KIND";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ActorResolutionError(String);

trait EnvReader {
    fn get(&self, key: &str) -> Option<String>;
}

struct RealEnv;

impl EnvReader for RealEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

fn resolve_with(
    flag: Option<&str>,
    kind_flag: Option<ActorKind>,
    user: &UserConfig,
    env: &dyn EnvReader,
) -> Result<Actor, ActorResolutionError> {
    let id = flag
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| env.get(ACTOR_ENV))
        .or_else(|| user.actor.clone().filter(|s| !s.trim().is_empty()));
    let Some(id) = id else {
        return Err(ActorResolutionError(format!(
            "no actor identity: pass --actor, set {ACTOR_ENV}, or set `actor` in the user config"
        )));
    };

    let kind = match kind_flag {
        Some(kind) => kind,
        None => match env.get(ACTOR_KIND_ENV) {
            Some(raw) => raw.parse().map_err(ActorResolutionError)?,
            None => user.actor_kind.unwrap_or(ActorKind::Human),
        },
    };
    Ok(Actor::new(kind, id.trim()))
}

/// Resolve the acting identity.
///
/// # Errors
///
/// Fails when no source names an actor, or `FILAMENT_ACTOR_KIND` is not a
/// known kind.
pub fn resolve_actor(
    flag: Option<&str>,
    kind_flag: Option<ActorKind>,
    user: &UserConfig,
) -> Result<Actor, ActorResolutionError> {
    resolve_with(flag, kind_flag, user, &RealEnv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeEnv(HashMap<&'static str, &'static str>);

    impl EnvReader for FakeEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| (*v).to_string())
        }
    }

    fn env(pairs: &[(&'static str, &'static str)]) -> FakeEnv {
        FakeEnv(pairs.iter().copied().collect())
    }

    #[test]
    fn flag_wins() {
        let user = UserConfig {
            actor: Some("carol".into()),
            ..UserConfig::default()
        };
        let actor = resolve_with(Some("alice"), None, &user, &env(&[(ACTOR_ENV, "bob")]))
            .expect("actor");
        assert_eq!(actor, Actor::human("alice"));
    }

    #[test]
    fn env_then_user_config() {
        let user = UserConfig {
            actor: Some("carol".into()),
            actor_kind: Some(ActorKind::Agent),
            ..UserConfig::default()
        };
        let from_env = resolve_with(None, None, &user, &env(&[(ACTOR_ENV, "bob")])).expect("env");
        assert_eq!(from_env, Actor::agent("bob"));
        let from_user = resolve_with(None, None, &user, &env(&[])).expect("user");
        assert_eq!(from_user, Actor::agent("carol"));
    }

    #[test]
    fn kind_flag_and_env() {
        let user = UserConfig::default();
        let e = env(&[(ACTOR_ENV, "cron"), (ACTOR_KIND_ENV, "system")]);
        assert_eq!(
            resolve_with(None, None, &user, &e).expect("env kind"),
            Actor::system("cron")
        );
        assert_eq!(
            resolve_with(None, Some(ActorKind::Agent), &user, &e).expect("flag kind"),
            Actor::agent("cron")
        );
        let bad = env(&[(ACTOR_ENV, "x"), (ACTOR_KIND_ENV, "robot")]);
        assert!(resolve_with(None, None, &user, &bad).is_err());
    }

    #[test]
    fn missing_actor_is_an_error() {
        let err = resolve_with(Some("  "), None, &UserConfig::default(), &env(&[]))
            .expect_err("none");
        assert!(err.to_string().contains(ACTOR_ENV));
    }
}
