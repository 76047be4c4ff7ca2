//! End-to-end tests for `ConfigService` over an in-memory SQLite store.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::TryStreamExt;
use scopecfg_core::{
  Error,
  clock::ManualClock,
  key::{DeclaredType, KeyFilter, KeyPatch, NewKeyDefinition},
  record::{NewRecord, Resolution},
  scope::{Scope, ScopeContext, ScopeDimension},
};
use scopecfg_store_sqlite::SqliteStore;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
  BulkItem, CacheConfig, ConfigService, EngineConfig, ExportFilter, ImportMode,
  PutValue, cache::ResolutionCache, coordinator::WriteCoordinator,
};

const COLOR: &str = "ui.theme.primaryColor";

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() }

async fn store() -> Arc<SqliteStore> {
  Arc::new(SqliteStore::open_in_memory().await.expect("in-memory store"))
}

fn config(background_refresh: bool) -> EngineConfig {
  EngineConfig {
    cache: CacheConfig {
      soft_ttl_secs: 60,
      hard_ttl_secs: 600,
      background_refresh,
    },
    list_page_size: 2,
    ..EngineConfig::default()
  }
}

fn service_on(
  store: Arc<SqliteStore>,
  clock: &ManualClock,
  config: EngineConfig,
) -> ConfigService<SqliteStore> {
  ConfigService::with_clock(store, config, Arc::new(clock.clone()))
}

async fn service() -> (ConfigService<SqliteStore>, ManualClock) {
  let clock = ManualClock::new(t0());
  (service_on(store().await, &clock, config(true)), clock)
}

fn color_key() -> NewKeyDefinition {
  NewKeyDefinition::new(COLOR, DeclaredType::String)
    .description("Primary theme colour")
    .category("theme")
    .scopes([ScopeDimension::Persona])
    .default_value(json!("#000000"))
}

fn everywhere_key(key: &str, declared_type: DeclaredType) -> NewKeyDefinition {
  NewKeyDefinition::new(key, declared_type)
    .category("agent")
    .scopes([
      ScopeDimension::Persona,
      ScopeDimension::Agent,
      ScopeDimension::Workflow,
    ])
}

fn persona(name: &str) -> Scope { Scope::Persona(name.into()) }

async fn value(
  svc: &ConfigService<SqliteStore>,
  key: &str,
  ctx: &ScopeContext,
) -> Option<Value> {
  svc.get_value(key, ctx).await.unwrap().into_value()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn default_served_when_no_records_exist() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  let resolved = svc.get_value(COLOR, &ScopeContext::global()).await.unwrap();
  assert_eq!(resolved, Resolution::Default { value: json!("#000000") });
}

#[tokio::test]
async fn persona_override_and_fallback_to_default() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  let record = svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#1E40AF")), "admin")
    .await
    .unwrap();
  assert_eq!(record.version, 1);

  assert_eq!(
    value(&svc, COLOR, &ScopeContext::persona("rachel")).await,
    Some(json!("#1E40AF"))
  );
  assert_eq!(
    value(&svc, COLOR, &ScopeContext::persona("john")).await,
    Some(json!("#000000"))
  );
}

#[tokio::test]
async fn scheduled_version_takes_effect_when_due() {
  let (svc, clock) = service().await;
  svc.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#1E40AF")), "admin")
    .await
    .unwrap();
  let later = svc
    .put_value(
      PutValue::new(COLOR, persona("rachel"), json!("#FFFFFF"))
        .effective_from(t0() + Duration::hours(1)),
      "admin",
    )
    .await
    .unwrap();
  assert_eq!(later.version, 2);

  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#1E40AF")));
  clock.advance(Duration::minutes(59));
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#1E40AF")));
  clock.advance(Duration::minutes(1));
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#FFFFFF")));
}

#[tokio::test]
async fn bulk_put_rejects_whole_batch_on_one_bad_item() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  svc
    .define_key(everywhere_key("agent.maxTokens", DeclaredType::Number))
    .await
    .unwrap();

  let items = vec![
    BulkItem::new(COLOR, persona("rachel"), json!("#111111")),
    BulkItem::new("agent.maxTokens", Scope::Global, json!(2048)),
    BulkItem::new("agent.maxTokens", Scope::Agent("a-1".into()), json!("plenty")),
    BulkItem::new(COLOR, persona("john"), json!("#222222")),
  ];
  let err = svc.bulk_put(items, "admin").await.unwrap_err();

  let Error::BulkValidation(problems) = err else {
    panic!("expected bulk validation error, got {err:?}");
  };
  assert_eq!(problems.len(), 1);
  assert_eq!(problems[0].index, 2);
  assert_eq!(problems[0].key, "agent.maxTokens");
  assert_eq!(problems[0].scope, Scope::Agent("a-1".into()));

  assert!(svc.get_history(COLOR, &persona("rachel")).await.unwrap().is_empty());
  assert!(svc.get_history(COLOR, &persona("john")).await.unwrap().is_empty());
  assert!(
    svc
      .get_history("agent.maxTokens", &Scope::Global)
      .await
      .unwrap()
      .is_empty()
  );
}

// ─── Resolution ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn most_specific_scope_wins() {
  let (svc, _) = service().await;
  svc
    .define_key(everywhere_key("agent.model", DeclaredType::String))
    .await
    .unwrap();

  let writes = [
    (Scope::Global, "base"),
    (persona("rachel"), "persona"),
    (Scope::Agent("a-7".into()), "agent"),
    (Scope::Workflow("claims".into()), "workflow"),
  ];
  for (scope, v) in writes {
    svc
      .put_value(PutValue::new("agent.model", scope, json!(v)), "admin")
      .await
      .unwrap();
  }

  let full = ScopeContext::persona("rachel")
    .with_agent("a-7")
    .with_workflow("claims");
  let cases = [
    (full.clone(), "workflow"),
    (full.clone().with_workflow("other"), "agent"),
    (ScopeContext::persona("rachel").with_agent("a-9"), "persona"),
    (ScopeContext::persona("john"), "base"),
    (ScopeContext::global(), "base"),
  ];
  for (ctx, expected) in cases {
    assert_eq!(
      value(&svc, "agent.model", &ctx).await,
      Some(json!(expected)),
      "context {ctx:?}"
    );
  }
}

#[tokio::test]
async fn disallowed_dimensions_are_skipped() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#ABCDEF")), "admin")
    .await
    .unwrap();

  // The agent dimension is not allowed for this key and must not shadow the
  // persona value.
  let ctx = ScopeContext::persona("rachel").with_agent("a-7");
  assert_eq!(value(&svc, COLOR, &ctx).await, Some(json!("#ABCDEF")));
}

#[tokio::test]
async fn empty_when_no_record_and_no_default() {
  let (svc, _) = service().await;
  svc
    .define_key(everywhere_key("agent.prompt", DeclaredType::String))
    .await
    .unwrap();
  let resolved = svc
    .get_value("agent.prompt", &ScopeContext::agent("a-1"))
    .await
    .unwrap();
  assert!(resolved.is_empty());
}

#[tokio::test]
async fn structured_values_come_back_parsed() {
  let (svc, _) = service().await;
  svc
    .define_key(everywhere_key("agent.tools", DeclaredType::Array))
    .await
    .unwrap();
  svc
    .define_key(everywhere_key("agent.limits", DeclaredType::Json))
    .await
    .unwrap();

  svc
    .put_value(
      PutValue::new("agent.tools", Scope::Global, json!(r#"["search", "calc"]"#)),
      "admin",
    )
    .await
    .unwrap();
  svc
    .put_value(
      PutValue::new("agent.limits", Scope::Global, json!({ "rpm": 60 })),
      "admin",
    )
    .await
    .unwrap();

  let ctx = ScopeContext::global();
  assert_eq!(value(&svc, "agent.tools", &ctx).await, Some(json!(["search", "calc"])));
  assert_eq!(value(&svc, "agent.limits", &ctx).await, Some(json!({ "rpm": 60 })));
}

#[tokio::test]
async fn unknown_key_is_an_error() {
  let (svc, _) = service().await;
  let err = svc
    .get_value("missing.key", &ScopeContext::global())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownKey(k) if k == "missing.key"));

  let err = svc
    .put_value(PutValue::new("missing.key", Scope::Global, json!(1)), "admin")
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownKey(_)));
}

#[tokio::test]
async fn as_of_reads_see_the_past() {
  let (svc, clock) = service().await;
  svc.define_key(color_key()).await.unwrap();
  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#010101")), "admin")
    .await
    .unwrap();
  clock.advance(Duration::days(1));
  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#020202")), "admin")
    .await
    .unwrap();

  let rachel = ScopeContext::persona("rachel");
  let past = svc
    .get_value_as_of(COLOR, &rachel, t0() + Duration::hours(1))
    .await
    .unwrap();
  assert_eq!(past.into_value(), Some(json!("#010101")));
  let before_any = svc
    .get_value_as_of(COLOR, &rachel, t0() - Duration::hours(1))
    .await
    .unwrap();
  assert_eq!(before_any.into_value(), Some(json!("#000000")));
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#020202")));
}

// ─── Writes ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn versions_are_gapless_and_history_newest_first() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  for i in 0..5 {
    svc
      .put_value(
        PutValue::new(COLOR, persona("rachel"), json!(format!("#00000{i}"))),
        "admin",
      )
      .await
      .unwrap();
  }
  svc
    .put_value(PutValue::new(COLOR, persona("john"), json!("#FFFFFF")), "admin")
    .await
    .unwrap();

  let history = svc.get_history(COLOR, &persona("rachel")).await.unwrap();
  let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
  assert_eq!(versions, [5, 4, 3, 2, 1]);
  assert_eq!(history[0].value, json!("#000004"));

  let john = svc.get_history(COLOR, &persona("john")).await.unwrap();
  assert_eq!(john.len(), 1);
  assert_eq!(john[0].version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_never_share_a_version() {
  let svc = ConfigService::new(store().await, EngineConfig::default());
  svc
    .define_key(everywhere_key("agent.temperature", DeclaredType::Number))
    .await
    .unwrap();

  let mut tasks = Vec::new();
  for i in 0..24 {
    let svc = svc.clone();
    let scope = if i % 2 == 0 {
      Scope::Agent("a-1".into())
    } else {
      Scope::Agent("a-2".into())
    };
    tasks.push(tokio::spawn(async move {
      svc
        .put_value(PutValue::new("agent.temperature", scope, json!(i)), "writer")
        .await
        .unwrap()
    }));
  }

  let mut per_scope: [BTreeSet<u64>; 2] = Default::default();
  for task in tasks {
    let record = task.await.unwrap();
    let slot = usize::from(record.scope == Scope::Agent("a-2".into()));
    assert!(per_scope[slot].insert(record.version), "duplicate version");
  }
  for versions in per_scope {
    assert_eq!(versions, (1..=12).collect::<BTreeSet<u64>>());
  }
}

#[tokio::test]
async fn type_and_scope_checked_on_write() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  let err = svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!(42)), "admin")
    .await
    .unwrap_err();
  assert!(matches!(err, Error::TypeValidation { .. }));

  let err = svc
    .put_value(PutValue::new(COLOR, Scope::Agent("a-1".into()), json!("#000001")), "admin")
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ScopeNotAllowed { .. }));

  assert!(svc.get_history(COLOR, &persona("rachel")).await.unwrap().is_empty());
}

#[tokio::test]
async fn form_input_is_coerced_before_storage() {
  let (svc, _) = service().await;
  svc
    .define_key(everywhere_key("agent.streaming", DeclaredType::Boolean))
    .await
    .unwrap();
  let record = svc
    .put_value(PutValue::new("agent.streaming", Scope::Global, json!("true")), "admin")
    .await
    .unwrap();
  assert_eq!(record.value, json!(true));
}

#[tokio::test]
async fn deactivation_falls_back_to_next_scope() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  let record = svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#123456")), "admin")
    .await
    .unwrap();
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#123456")));

  let deactivated = svc.deactivate_value(record.record_id, "auditor").await.unwrap();
  assert!(!deactivated.is_active);
  assert_eq!(deactivated.deactivated_by.as_deref(), Some("auditor"));
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#000000")));

  let again = svc.deactivate_value(record.record_id, "someone-else").await.unwrap();
  assert_eq!(again.deactivated_by.as_deref(), Some("auditor"));

  let history = svc.get_history(COLOR, &persona("rachel")).await.unwrap();
  assert_eq!(history.len(), 1);

  let err = svc.deactivate_value(Uuid::new_v4(), "auditor").await.unwrap_err();
  assert!(matches!(err, Error::RecordNotFound(_)));
}

#[tokio::test]
async fn write_against_outdated_definition_is_refused() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let writer = service_on(Arc::clone(&store), &clock, config(false));
  let admin = service_on(store, &clock, config(false));
  writer
    .define_key(everywhere_key("agent.budget", DeclaredType::String))
    .await
    .unwrap();

  // Another instance retypes the still-unused key; the writer's cached
  // definition still says string.
  let retype = KeyPatch {
    declared_type: Some(DeclaredType::Number),
    ..KeyPatch::default()
  };
  admin.update_key("agent.budget", retype).await.unwrap();

  let put = PutValue::new("agent.budget", Scope::Global, json!("lots"));
  let err = writer.put_value(put.clone(), "admin").await.unwrap_err();
  assert!(matches!(err, Error::DefinitionChanged(ref k) if k == "agent.budget"));
  assert!(err.is_retryable());
  assert!(
    writer
      .get_history("agent.budget", &Scope::Global)
      .await
      .unwrap()
      .is_empty()
  );

  // The retry sees the new type.
  let err = writer.put_value(put, "admin").await.unwrap_err();
  assert!(matches!(err, Error::TypeValidation { .. }));
  let record = writer
    .put_value(PutValue::new("agent.budget", Scope::Global, json!(12)), "admin")
    .await
    .unwrap();
  assert_eq!(record.value, json!(12));
}

#[tokio::test]
async fn definitions_and_records_apply_together() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let svc = service_on(Arc::clone(&store), &clock, config(false));
  let existing = svc.define_key(color_key()).await.unwrap();
  let fresh = NewKeyDefinition::new("agent.model", DeclaredType::String)
    .into_definition(t0())
    .unwrap();

  let cache = Arc::new(ResolutionCache::new(&CacheConfig::default()));
  let coordinator = WriteCoordinator::new(store, cache, 3);
  let record = NewRecord {
    config_key:     "agent.model".into(),
    declared_type:  DeclaredType::String,
    scope:          Scope::Global,
    value:          json!("small"),
    effective_from: t0(),
    created_at:     t0(),
    created_by:     "importer".into(),
  };

  let err = coordinator
    .apply(vec![fresh.clone(), existing], vec![record.clone()])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::DuplicateKey(ref k) if k == COLOR));
  assert!(matches!(
    svc.get_key("agent.model").await.unwrap_err(),
    Error::UnknownKey(_)
  ));

  let written = coordinator.apply(vec![fresh], vec![record]).await.unwrap();
  assert_eq!(written[0].version, 1);
  assert_eq!(
    value(&svc, "agent.model", &ScopeContext::global()).await,
    Some(json!("small"))
  );
}

#[tokio::test]
async fn lock_table_is_pruned_after_writes() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let svc = service_on(Arc::clone(&store), &clock, config(false));
  let def = svc.define_key(color_key()).await.unwrap();

  let cache = Arc::new(ResolutionCache::new(&CacheConfig::default()));
  let coordinator = WriteCoordinator::new(store, cache, 3);
  coordinator
    .write(&def, persona("rachel"), json!("#0F0F0F"), t0(), t0(), "admin")
    .await
    .unwrap();
  assert_eq!(coordinator.lock_table_len(), 0);
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn writes_invalidate_cached_values() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#000000")));
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#000000")));
  assert_eq!(svc.cache_stats().hits, 1);

  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#FEFEFE")), "admin")
    .await
    .unwrap();
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#FEFEFE")));
  assert!(svc.cache_stats().invalidations >= 1);
}

#[tokio::test]
async fn hard_expiry_forces_a_fresh_read() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let reader = service_on(Arc::clone(&store), &clock, config(true));
  let writer = service_on(store, &clock, config(true));
  writer.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#000000")));

  // Another instance writes; the reader's cache does not see the
  // invalidation.
  writer
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#C0FFEE")), "admin")
    .await
    .unwrap();
  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#000000")));

  clock.advance(Duration::seconds(600));
  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#C0FFEE")));
}

#[tokio::test]
async fn stale_entries_are_served_then_refreshed() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let reader = service_on(Arc::clone(&store), &clock, config(true));
  let writer = service_on(store, &clock, config(true));
  writer.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#000000")));
  writer
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#BADA55")), "admin")
    .await
    .unwrap();

  clock.advance(Duration::seconds(61));
  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#000000")));
  assert_eq!(reader.cache_stats().stale_hits, 1);

  let mut refreshed = None;
  for _ in 0..100 {
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let current = value(&reader, COLOR, &rachel).await;
    if current == Some(json!("#BADA55")) {
      refreshed = current;
      break;
    }
  }
  assert_eq!(refreshed, Some(json!("#BADA55")));
}

#[tokio::test]
async fn stale_entries_refresh_inline_without_background_mode() {
  let store = store().await;
  let clock = ManualClock::new(t0());
  let reader = service_on(Arc::clone(&store), &clock, config(false));
  let writer = service_on(store, &clock, config(false));
  writer.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");

  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#000000")));
  writer
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#0DDBA1")), "admin")
    .await
    .unwrap();
  clock.advance(Duration::seconds(61));
  assert_eq!(value(&reader, COLOR, &rachel).await, Some(json!("#0DDBA1")));
}

#[tokio::test]
async fn expired_entries_leave_the_cache() {
  let (svc, clock) = service().await;
  svc.define_key(color_key()).await.unwrap();

  for i in 0..200 {
    value(&svc, COLOR, &ScopeContext::persona(format!("p{i}"))).await;
  }
  assert_eq!(svc.cache_stats().entries, 200);

  clock.advance(Duration::hours(24));
  value(&svc, COLOR, &ScopeContext::persona("late")).await;
  let stats = svc.cache_stats();
  assert_eq!(stats.entries, 1);
  assert_eq!(stats.evictions, 200);
}

#[tokio::test]
async fn flush_cache_is_always_safe() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  let rachel = ScopeContext::persona("rachel");
  value(&svc, COLOR, &rachel).await;

  svc.flush_cache();
  assert_eq!(svc.cache_stats().entries, 0);
  assert_eq!(value(&svc, COLOR, &rachel).await, Some(json!("#000000")));
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn registry_rejects_bad_definitions() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  let err = svc.define_key(color_key()).await.unwrap_err();
  assert!(matches!(err, Error::DuplicateKey(_)));

  let bad_default = NewKeyDefinition::new("agent.retries", DeclaredType::Number)
    .default_value(json!("several"));
  let err = svc.define_key(bad_default).await.unwrap_err();
  assert!(matches!(err, Error::TypeValidation { .. }));

  let err = svc.get_key("agent.retries").await.unwrap_err();
  assert!(matches!(err, Error::UnknownKey(_)));
}

#[tokio::test]
async fn list_keys_streams_in_key_order() {
  let (svc, _) = service().await;
  for key in ["e.five", "a.one", "c.three", "b.two", "d.four"] {
    svc
      .define_key(everywhere_key(key, DeclaredType::String))
      .await
      .unwrap();
  }
  svc.define_key(color_key()).await.unwrap();

  let all: Vec<String> = svc
    .list_keys(KeyFilter::default())
    .map_ok(|def| def.key)
    .try_collect()
    .await
    .unwrap();
  assert_eq!(all, ["a.one", "b.two", "c.three", "d.four", "e.five", COLOR]);

  let agent_scoped: Vec<String> = svc
    .list_keys(KeyFilter {
      scope_dimension: Some(ScopeDimension::Agent),
      ..KeyFilter::default()
    })
    .map_ok(|def| def.key)
    .try_collect()
    .await
    .unwrap();
  assert_eq!(agent_scoped.len(), 5);

  let theme: Vec<String> = svc
    .list_keys(KeyFilter {
      category: Some("theme".into()),
      ..KeyFilter::default()
    })
    .map_ok(|def| def.key)
    .try_collect()
    .await
    .unwrap();
  assert_eq!(theme, [COLOR]);
}

#[tokio::test]
async fn update_key_refuses_type_change_once_used() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();

  let patch = KeyPatch {
    description: Some("Accent colour".into()),
    ..KeyPatch::default()
  };
  let updated = svc.update_key(COLOR, patch).await.unwrap();
  assert_eq!(updated.description, "Accent colour");
  assert_eq!(svc.get_key(COLOR).await.unwrap().description, "Accent colour");

  svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#999999")), "admin")
    .await
    .unwrap();
  let retype = KeyPatch {
    declared_type: Some(DeclaredType::Json),
    default_value: Some(Some(json!({ "primary": "#000000" }))),
    ..KeyPatch::default()
  };
  let err = svc.update_key(COLOR, retype).await.unwrap_err();
  assert!(matches!(err, Error::TypeLocked(_)));
}

#[tokio::test]
async fn update_key_default_is_visible_immediately() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  let john = ScopeContext::persona("john");
  assert_eq!(value(&svc, COLOR, &john).await, Some(json!("#000000")));

  let patch = KeyPatch {
    default_value: Some(Some(json!("#333333"))),
    ..KeyPatch::default()
  };
  svc.update_key(COLOR, patch).await.unwrap();
  assert_eq!(value(&svc, COLOR, &john).await, Some(json!("#333333")));
}

#[tokio::test]
async fn remove_key_only_when_unused() {
  let (svc, _) = service().await;
  svc.define_key(color_key()).await.unwrap();
  svc
    .define_key(everywhere_key("agent.unused", DeclaredType::String))
    .await
    .unwrap();

  let record = svc
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#ABABAB")), "admin")
    .await
    .unwrap();
  svc.deactivate_value(record.record_id, "admin").await.unwrap();

  let err = svc.remove_key(COLOR).await.unwrap_err();
  assert!(matches!(err, Error::KeyInUse { records: 1, .. }));

  svc.remove_key("agent.unused").await.unwrap();
  let err = svc.get_key("agent.unused").await.unwrap_err();
  assert!(matches!(err, Error::UnknownKey(_)));
  let err = svc.remove_key("agent.unused").await.unwrap_err();
  assert!(matches!(err, Error::UnknownKey(_)));
}

// ─── Export / import ─────────────────────────────────────────────────────────

async fn seeded() -> (ConfigService<SqliteStore>, ManualClock) {
  let (svc, clock) = service().await;
  svc.define_key(color_key()).await.unwrap();
  svc
    .define_key(everywhere_key("agent.maxTokens", DeclaredType::Number))
    .await
    .unwrap();
  let items = vec![
    BulkItem::new(COLOR, persona("rachel"), json!("#1E40AF")),
    BulkItem::new("agent.maxTokens", Scope::Global, json!(1024)),
    BulkItem::new("agent.maxTokens", Scope::Agent("a-7".into()), json!("4096")),
  ];
  svc.bulk_put(items, "seed").await.unwrap();
  (svc, clock)
}

#[tokio::test]
async fn export_then_import_reproduces_values() {
  let (source, _) = seeded().await;
  let doc = source.export(&ExportFilter::default()).await.unwrap();
  assert_eq!(doc.format_version, 1);
  assert_eq!(doc.entries.len(), 2);
  assert!(doc.verify_checksum().unwrap());

  // Survives a trip through JSON text.
  let doc = serde_json::from_str(&serde_json::to_string(&doc).unwrap()).unwrap();

  let (target, _) = service().await;
  let written = target
    .import(doc, ImportMode::DefineMissing, "importer")
    .await
    .unwrap();
  assert_eq!(written.len(), 3);

  let contexts = [
    (COLOR, ScopeContext::persona("rachel")),
    (COLOR, ScopeContext::persona("john")),
    ("agent.maxTokens", ScopeContext::agent("a-7")),
    ("agent.maxTokens", ScopeContext::agent("a-8")),
  ];
  for (key, ctx) in contexts {
    assert_eq!(
      value(&target, key, &ctx).await,
      value(&source, key, &ctx).await,
      "{key} for {ctx:?}"
    );
  }
  assert_eq!(
    value(&target, "agent.maxTokens", &ScopeContext::agent("a-7")).await,
    Some(json!(4096))
  );
}

#[tokio::test]
async fn export_can_be_narrowed_to_one_scope() {
  let (svc, _) = seeded().await;
  let doc = svc
    .export(&ExportFilter {
      scope: Some(Scope::Agent("a-7".into())),
      ..ExportFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(doc.entries.len(), 1);
  assert_eq!(doc.entries[0].definition.key, "agent.maxTokens");
  assert_eq!(doc.entries[0].values.len(), 1);
  assert_eq!(doc.entries[0].values[0].value, json!(4096));
}

#[tokio::test]
async fn export_omits_values_the_key_no_longer_allows() {
  let (source, _) = service().await;
  source.define_key(color_key()).await.unwrap();
  source
    .put_value(PutValue::new(COLOR, persona("rachel"), json!("#1E40AF")), "admin")
    .await
    .unwrap();
  let global_only = KeyPatch {
    allowed_scopes: Some(BTreeSet::new()),
    ..KeyPatch::default()
  };
  source.update_key(COLOR, global_only).await.unwrap();

  let doc = source.export(&ExportFilter::default()).await.unwrap();
  assert!(doc.entries[0].values.is_empty());
  let narrowed = source
    .export(&ExportFilter {
      scope: Some(persona("rachel")),
      ..ExportFilter::default()
    })
    .await
    .unwrap();
  assert!(narrowed.entries.iter().all(|e| e.values.is_empty()));

  let (target, _) = service().await;
  target
    .import(doc, ImportMode::DefineMissing, "importer")
    .await
    .unwrap();
  let ctx = ScopeContext::persona("rachel");
  assert_eq!(value(&target, COLOR, &ctx).await, value(&source, COLOR, &ctx).await);
  assert_eq!(value(&target, COLOR, &ctx).await, Some(json!("#000000")));
}

#[tokio::test]
async fn import_reports_every_problem_and_applies_nothing() {
  let (source, _) = seeded().await;
  let mut doc = source.export(&ExportFilter::default()).await.unwrap();

  let (target, _) = service().await;
  let err = target
    .import(doc.clone(), ImportMode::RequireKeys, "importer")
    .await
    .unwrap_err();
  let Error::ImportValidation(problems) = err else {
    panic!("expected import validation error, got {err:?}");
  };
  assert_eq!(problems.len(), 2);
  assert!(problems.iter().all(|p| p.key.is_some()));

  // A hand-edited document fails its checksum.
  doc.entries[0].values.push(crate::transfer::ExportedValue {
    scope:          Scope::Agent("a-8".into()),
    value:          json!("not a number"),
    version:        1,
    effective_from: t0(),
  });
  let err = source
    .import(doc, ImportMode::RequireKeys, "importer")
    .await
    .unwrap_err();
  let Error::ImportValidation(problems) = err else {
    panic!("expected import validation error, got {err:?}");
  };
  assert!(problems.iter().any(|p| p.key.is_none() && p.reason.contains("checksum")));
  assert!(problems.iter().any(|p| p.scope == Some(Scope::Agent("a-8".into()))));

  assert!(
    source
      .get_history("agent.maxTokens", &Scope::Agent("a-8".into()))
      .await
      .unwrap()
      .is_empty()
  );
  assert_eq!(
    target.list_keys(KeyFilter::default()).try_collect::<Vec<_>>().await.unwrap().len(),
    0
  );
}

#[tokio::test]
async fn import_rejects_type_disagreement() {
  let (source, _) = seeded().await;
  let doc = source.export(&ExportFilter::default()).await.unwrap();

  let (target, _) = service().await;
  target
    .define_key(everywhere_key("agent.maxTokens", DeclaredType::String))
    .await
    .unwrap();
  let err = target
    .import(doc, ImportMode::DefineMissing, "importer")
    .await
    .unwrap_err();
  let Error::ImportValidation(problems) = err else {
    panic!("expected import validation error, got {err:?}");
  };
  assert_eq!(problems.len(), 1);
  assert_eq!(problems[0].key.as_deref(), Some("agent.maxTokens"));
  assert!(target.get_key(COLOR).await.is_err());
}
