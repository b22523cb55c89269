//! Bi-temporal graph ingestion + hybrid retrieval + grouped history (spec
//! §4.F). Generalizes `memory::long_term::LongTermMemory`'s embed-and-store/
//! cosine-recall pair from flat memory entries to Episode/Entity/Edge with
//! `valid_at`/`invalid_at` bounds and contradiction handling. The
//! keyword half of hybrid search has no teacher analogue and is built
//! straight from spec §4.F.1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use super::store::GraphStoreDriver;
use crate::error::MemoryResult;
use crate::llm::gateway::cosine_similarity;
use crate::llm::{ChatMessage, LlmGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Text,
    Message,
    Json,
}

#[derive(Debug, Clone)]
pub struct Episode {
    pub uuid: String,
    pub name: String,
    pub body: String,
    pub source_type: SourceType,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub subject_name: String,
    pub predicate_name: String,
    pub object_name: String,
    pub fact_text: String,
    pub valid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EdgeResult {
    pub fact: String,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub score: f32,
    pub edge_uuid: String,
}

#[derive(Debug, Clone)]
pub struct HistoryEdge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub fact: String,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub edges: Vec<EdgeResult>,
    pub backfilled_episodes: Vec<Episode>,
}

pub struct TemporalMemoryEngine {
    driver: GraphStoreDriver,
}

fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

impl TemporalMemoryEngine {
    pub fn new(driver: GraphStoreDriver) -> Self {
        Self { driver }
    }

    /// Persist the episode, extract entities/facts, resolve entities,
    /// check contradiction per `(subject, predicate, object-type)` family,
    /// and add `MENTIONS` edges (spec §4.F.1-5). Idempotent only in the
    /// weak sense: replaying a body may recreate entities/edges.
    pub async fn add_episode<G: LlmGateway>(
        &self,
        user: &str,
        body: &str,
        source_type: SourceType,
        reference_time: DateTime<Utc>,
        source_description: &str,
        gateway: &G,
    ) -> MemoryResult<Episode> {
        let handle = self.driver.handle(user).await?;
        let episode = Episode {
            uuid: Uuid::new_v4().to_string(),
            name: format!("episode-{}", reference_time.format("%Y%m%dT%H%M%S")),
            body: body.to_string(),
            source_type,
            source_description: source_description.to_string(),
            reference_time,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO episodes (uuid, name, body, source_type, source_description, reference_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&episode.uuid)
        .bind(&episode.name)
        .bind(&episode.body)
        .bind(source_type_str(source_type))
        .bind(&episode.source_description)
        .bind(episode.reference_time)
        .bind(episode.created_at)
        .execute(&handle.pool)
        .await?;

        let entities = self.extract_entities(body, gateway).await.unwrap_or_default();
        let mut resolved_uuids = Vec::new();
        for entity in &entities {
            let uuid = self.resolve_or_create_entity(&handle.pool, entity, gateway).await?;
            resolved_uuids.push((entity.name.clone(), uuid));
        }

        let facts = self
            .extract_facts(body, &entities, reference_time, gateway)
            .await
            .unwrap_or_default();

        for fact in facts {
            let Some((_, subject_uuid)) = resolved_uuids.iter().find(|(n, _)| n == &fact.subject_name) else {
                continue;
            };
            let object_uuid = resolved_uuids
                .iter()
                .find(|(n, _)| n == &fact.object_name)
                .map(|(_, u)| u.clone());

            self.add_fact_edge(&handle.pool, subject_uuid, &fact, object_uuid, gateway)
                .await?;
        }

        for (_, entity_uuid) in &resolved_uuids {
            self.add_mentions_edge(&handle.pool, &episode.uuid, entity_uuid).await?;
        }

        tracing::info!(user, episode = %episode.uuid, "episode ingested");
        Ok(episode)
    }

    async fn extract_entities<G: LlmGateway>(
        &self,
        body: &str,
        gateway: &G,
    ) -> MemoryResult<Vec<ExtractedEntity>> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "extracted_entities": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"name": {"type": "string"}, "summary": {"type": "string"}},
                        "required": ["name"]
                    }
                }
            }
        });
        let messages = [
            ChatMessage::system("Extract named entities as JSON."),
            ChatMessage::user(format!("Text:\n{body}\n\nExtract entities.")),
        ];
        let value = gateway
            .json(&messages, &schema, "extractor", 2048, "extracted_entities")
            .await?;
        let entities = value
            .get("extracted_entities")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(entities
            .into_iter()
            .filter_map(|v| {
                let name = v.get("name")?.as_str()?.to_string();
                let summary = v.get("summary").and_then(|s| s.as_str()).unwrap_or("").to_string();
                Some(ExtractedEntity { name, summary })
            })
            .collect())
    }

    async fn extract_facts<G: LlmGateway>(
        &self,
        body: &str,
        entities: &[ExtractedEntity],
        reference_time: DateTime<Utc>,
        gateway: &G,
    ) -> MemoryResult<Vec<ExtractedFact>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "facts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "subject": {"type": "string"},
                            "predicate": {"type": "string"},
                            "object": {"type": "string"},
                            "fact_text": {"type": "string"},
                            "valid_at": {"type": "string"}
                        },
                        "required": ["subject", "predicate", "object", "fact_text"]
                    }
                }
            }
        });
        let entity_names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let messages = [
            ChatMessage::system("Extract typed facts between entities as JSON."),
            ChatMessage::user(format!(
                "Text:\n{body}\n\nKnown entities: {entity_names:?}\nExtract facts among these entities."
            )),
        ];
        let value = gateway.json(&messages, &schema, "extractor", 2048, "facts").await?;
        let facts = value.get("facts").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        Ok(facts
            .into_iter()
            .filter_map(|v| {
                let subject_name = v.get("subject")?.as_str()?.to_string();
                let predicate_name = v.get("predicate")?.as_str()?.to_string();
                let object_name = v.get("object")?.as_str()?.to_string();
                let fact_text = v.get("fact_text")?.as_str()?.to_string();
                let valid_at = v
                    .get("valid_at")
                    .and_then(|s| s.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .or(Some(reference_time));
                Some(ExtractedFact {
                    subject_name,
                    predicate_name,
                    object_name,
                    fact_text,
                    valid_at,
                })
            })
            .collect())
    }

    /// Resolve an entity by similarity (vector + name) or create a new one.
    async fn resolve_or_create_entity<G: LlmGateway>(
        &self,
        pool: &Pool<Sqlite>,
        entity: &ExtractedEntity,
        gateway: &G,
    ) -> MemoryResult<String> {
        let embedding = gateway
            .embed(&[entity.name.clone()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let rows = sqlx::query("SELECT uuid, name, embedding FROM entities").fetch_all(pool).await?;
        for row in rows {
            let name: String = row.get("name");
            if name == entity.name {
                return Ok(row.get("uuid"));
            }
            let existing_embedding: Vec<u8> = row.get("embedding");
            let existing_vec = bytes_to_vec(&existing_embedding);
            if cosine_similarity(&embedding, &existing_vec) > 0.92 {
                return Ok(row.get("uuid"));
            }
        }

        let uuid = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO entities (uuid, name, summary, embedding) VALUES (?, ?, ?, ?)")
            .bind(&uuid)
            .bind(&entity.name)
            .bind(&entity.summary)
            .bind(vec_to_bytes(&embedding))
            .execute(pool)
            .await?;
        Ok(uuid)
    }

    /// Check contradiction against current edges of the same
    /// `(subject, predicate, object-type)` family: invalidate the existing
    /// edge and add the new one, or just add (spec §4.F.4).
    async fn add_fact_edge<G: LlmGateway>(
        &self,
        pool: &Pool<Sqlite>,
        subject_uuid: &str,
        fact: &ExtractedFact,
        object_uuid: Option<String>,
        gateway: &G,
    ) -> MemoryResult<()> {
        let embedding = gateway
            .embed(&[fact.fact_text.clone()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let current = sqlx::query(
            "SELECT uuid FROM edges WHERE subject_entity = ? AND predicate_name = ? AND is_mentions = 0 AND invalid_at IS NULL",
        )
        .bind(subject_uuid)
        .bind(&fact.predicate_name)
        .fetch_all(pool)
        .await?;

        for row in current {
            let existing_uuid: String = row.get("uuid");
            sqlx::query("UPDATE edges SET invalid_at = ? WHERE uuid = ?")
                .bind(fact.valid_at)
                .bind(&existing_uuid)
                .execute(pool)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO edges (uuid, subject_entity, predicate_name, object_entity, fact_text, embedding, valid_at, invalid_at, created_at, is_mentions)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, 0)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(subject_uuid)
        .bind(&fact.predicate_name)
        .bind(object_uuid)
        .bind(&fact.fact_text)
        .bind(vec_to_bytes(&embedding))
        .bind(fact.valid_at)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn add_mentions_edge(&self, pool: &Pool<Sqlite>, episode_uuid: &str, entity_uuid: &str) -> MemoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO edges (uuid, subject_entity, predicate_name, object_entity, fact_text, embedding, created_at, is_mentions, episode_uuid)
            VALUES (?, ?, 'MENTIONS', ?, '', ?, ?, 1, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(episode_uuid)
        .bind(entity_uuid)
        .bind(Vec::<u8>::new())
        .bind(Utc::now())
        .bind(episode_uuid)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Hybrid search over `fact_text` (vector + keyword), rerank, keep
    /// top-k. `MENTIONS` edges are always excluded (spec §3, §4.F).
    pub async fn search<G: LlmGateway>(
        &self,
        user: &str,
        query: &str,
        k: usize,
        backfill_episodes: bool,
        gateway: &G,
    ) -> MemoryResult<SearchResult> {
        let handle = self.driver.handle(user).await?;
        let query_embedding = gateway.embed(&[query.to_string()]).await?.into_iter().next().unwrap_or_default();

        let rows = sqlx::query(
            "SELECT uuid, fact_text, embedding, valid_at, invalid_at, created_at FROM edges WHERE is_mentions = 0",
        )
        .fetch_all(&handle.pool)
        .await?;

        let query_lower = query.to_lowercase();
        let mut candidates: Vec<(f32, EdgeResult)> = rows
            .into_iter()
            .map(|row| {
                let fact_text: String = row.get("fact_text");
                let embedding_bytes: Vec<u8> = row.get("embedding");
                let vector_score = cosine_similarity(&query_embedding, &bytes_to_vec(&embedding_bytes));
                let keyword_score = if fact_text.to_lowercase().contains(&query_lower) { 1.0 } else { 0.0 };
                let hybrid_score = 0.7 * vector_score + 0.3 * keyword_score;
                (
                    hybrid_score,
                    EdgeResult {
                        fact: fact_text,
                        valid_at: row.get("valid_at"),
                        invalid_at: row.get("invalid_at"),
                        created_at: row.get("created_at"),
                        score: hybrid_score,
                        edge_uuid: row.get("uuid"),
                    },
                )
            })
            .collect();

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_candidates: Vec<EdgeResult> = candidates.into_iter().take(k.max(1) * 2).map(|(_, e)| e).collect();

        let texts: Vec<String> = top_candidates.iter().map(|e| e.fact.clone()).collect();
        let rerank_scores = gateway.rerank(query, &texts).await.unwrap_or_else(|_| vec![0.0; texts.len()]);

        let mut reranked: Vec<EdgeResult> = top_candidates
            .into_iter()
            .zip(rerank_scores)
            .map(|(mut e, score)| {
                e.score = score;
                e
            })
            .collect();
        reranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        reranked.truncate(k);

        let backfilled_episodes = if backfill_episodes && !reranked.is_empty() {
            self.backfill_episodes(&handle.pool, &reranked).await?
        } else {
            Vec::new()
        };

        Ok(SearchResult {
            edges: reranked,
            backfilled_episodes,
        })
    }

    /// For the union of returned edge endpoints, find episodes that
    /// `MENTIONS` any endpoint entity, deduplicated, newest first (spec
    /// §4.F.3, "optional, gated").
    async fn backfill_episodes(&self, pool: &Pool<Sqlite>, edges: &[EdgeResult]) -> MemoryResult<Vec<Episode>> {
        let edge_uuids: Vec<String> = edges.iter().map(|e| e.edge_uuid.clone()).collect();
        if edge_uuids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = edge_uuids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT DISTINCT subject_entity, object_entity FROM edges WHERE uuid IN ({placeholders}) AND is_mentions = 0"
        );
        let mut q = sqlx::query(&sql);
        for uuid in &edge_uuids {
            q = q.bind(uuid);
        }
        let endpoint_rows = q.fetch_all(pool).await?;
        let mut entity_uuids = Vec::new();
        for row in endpoint_rows {
            entity_uuids.push(row.get::<String, _>("subject_entity"));
            if let Ok(obj) = row.try_get::<String, _>("object_entity") {
                entity_uuids.push(obj);
            }
        }
        entity_uuids.sort();
        entity_uuids.dedup();
        if entity_uuids.is_empty() {
            return Ok(Vec::new());
        }

        let entity_placeholders = entity_uuids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            r#"
            SELECT DISTINCT ep.uuid, ep.name, ep.body, ep.source_type, ep.source_description, ep.reference_time, ep.created_at
            FROM episodes ep
            JOIN edges m ON m.episode_uuid = ep.uuid AND m.is_mentions = 1
            WHERE m.object_entity IN ({entity_placeholders})
            ORDER BY ep.created_at DESC
            "#
        );
        let mut q = sqlx::query(&sql);
        for uuid in &entity_uuids {
            q = q.bind(uuid);
        }
        let rows = q.fetch_all(pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| Episode {
                uuid: row.get("uuid"),
                name: row.get("name"),
                body: row.get("body"),
                source_type: parse_source_type(row.get::<String, _>("source_type").as_str()),
                source_description: row.get("source_description"),
                reference_time: row.get("reference_time"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Every non-`MENTIONS` edge, plus a grouping by predicate sorted by
    /// `valid_at` ascending (the "history" view, spec §4.F.Dump).
    pub async fn get_all(&self, user: &str) -> MemoryResult<Vec<HistoryEdge>> {
        let handle = self.driver.handle(user).await?;
        let rows = sqlx::query(
            r#"
            SELECT e.subject_entity, e.predicate_name, e.object_entity, e.fact_text, e.valid_at, e.invalid_at, e.created_at
            FROM edges e WHERE e.is_mentions = 0
            "#,
        )
        .fetch_all(&handle.pool)
        .await?;

        let mut edges: Vec<HistoryEdge> = Vec::new();
        for row in rows {
            let subject_uuid: String = row.get("subject_entity");
            let object_uuid: Option<String> = row.get("object_entity");
            let subject = self.entity_name(&handle.pool, &subject_uuid).await?;
            let object = match object_uuid {
                Some(uuid) => self.entity_name(&handle.pool, &uuid).await?,
                None => String::new(),
            };
            let invalid_at: Option<DateTime<Utc>> = row.get("invalid_at");
            edges.push(HistoryEdge {
                subject,
                predicate: row.get("predicate_name"),
                object,
                fact: row.get("fact_text"),
                valid_at: row.get("valid_at"),
                invalid_at,
                created_at: row.get("created_at"),
                is_current: invalid_at.is_none(),
            });
        }

        edges.sort_by_key(|e| e.valid_at);
        Ok(edges)
    }

    /// Same edges as [`Self::get_all`], grouped by predicate, each group
    /// sorted by `valid_at` ascending (spec §4.F's Dump operation, literally:
    /// a grouping, not just a globally-sorted flat list).
    pub async fn get_grouped(&self, user: &str) -> MemoryResult<std::collections::HashMap<String, Vec<HistoryEdge>>> {
        let mut groups: std::collections::HashMap<String, Vec<HistoryEdge>> = std::collections::HashMap::new();
        for edge in self.get_all(user).await? {
            groups.entry(edge.predicate.clone()).or_default().push(edge);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|e| e.valid_at);
        }
        Ok(groups)
    }

    async fn entity_name(&self, pool: &Pool<Sqlite>, uuid: &str) -> MemoryResult<String> {
        let row = sqlx::query_scalar::<_, String>("SELECT name FROM entities WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(pool)
            .await?;
        Ok(row.unwrap_or_default())
    }

    pub async fn clear(&self, user: &str) -> MemoryResult<()> {
        self.driver.drop_all(user).await
    }
}

fn source_type_str(s: SourceType) -> &'static str {
    match s {
        SourceType::Text => "text",
        SourceType::Message => "message",
        SourceType::Json => "json",
    }
}

fn parse_source_type(s: &str) -> SourceType {
    match s {
        "message" => SourceType::Message,
        "json" => SourceType::Json,
        _ => SourceType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGateway;
    use serde_json::json;

    fn entity_json(name: &str) -> serde_json::Value {
        json!({"extracted_entities": [{"name": name, "summary": ""}]})
    }

    #[tokio::test]
    async fn ingest_and_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GraphStoreDriver::new(dir.path());
        let engine = TemporalMemoryEngine::new(driver);
        let gateway = FakeGateway::default();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "最喜欢的水果", "object": "", "fact_text": "用户最喜欢的水果是苹果"
        }]}));

        engine
            .add_episode(
                "alice",
                "用户最喜欢的水果是苹果",
                SourceType::Text,
                Utc::now(),
                "chat",
                &gateway,
            )
            .await
            .unwrap();

        let result = engine.search("alice", "水果", 5, false, &gateway).await.unwrap();
        assert_eq!(result.edges.len(), 1);
        assert!(result.edges[0].fact.contains("苹果"));
        assert!(result.edges[0].invalid_at.is_none());
    }

    #[tokio::test]
    async fn contradicting_fact_invalidates_old_edge() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GraphStoreDriver::new(dir.path());
        let engine = TemporalMemoryEngine::new(driver);
        let gateway = FakeGateway::default();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "最喜欢的水果", "object": "", "fact_text": "用户最喜欢的水果是苹果"
        }]}));
        engine
            .add_episode("bob", "用户最喜欢的水果是苹果", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "最喜欢的水果", "object": "", "fact_text": "用户现在喜欢橙子"
        }]}));
        engine
            .add_episode("bob", "用户现在喜欢橙子", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        let history = engine.get_all("bob").await.unwrap();
        assert_eq!(history.len(), 2);
        let current: Vec<_> = history.iter().filter(|e| e.is_current).collect();
        assert_eq!(current.len(), 1);
        assert!(current[0].fact.contains("橙子"));
        let invalidated = history.iter().find(|e| !e.is_current).unwrap();
        assert!(invalidated.fact.contains("苹果"));
    }

    #[tokio::test]
    async fn get_grouped_separates_by_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GraphStoreDriver::new(dir.path());
        let engine = TemporalMemoryEngine::new(driver);
        let gateway = FakeGateway::default();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "职业", "object": "", "fact_text": "用户是程序员"
        }]}));
        engine
            .add_episode("alice", "用户是程序员", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "最喜欢的水果", "object": "", "fact_text": "用户喜欢苹果"
        }]}));
        engine
            .add_episode("alice", "用户喜欢苹果", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        let grouped = engine.get_grouped("alice").await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped.get("职业").unwrap().len(), 1);
        assert_eq!(grouped.get("最喜欢的水果").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cross_user_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GraphStoreDriver::new(dir.path());
        let engine = TemporalMemoryEngine::new(driver);
        let gateway = FakeGateway::default();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": [{
            "subject": "用户", "predicate": "职业", "object": "", "fact_text": "用户是程序员"
        }]}));
        engine
            .add_episode("alice", "用户是程序员", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        let result = engine.search("bob", "程序员", 5, false, &gateway).await.unwrap();
        assert!(result.edges.is_empty());
    }

    #[tokio::test]
    async fn clear_drops_partition() {
        let dir = tempfile::tempdir().unwrap();
        let driver = GraphStoreDriver::new(dir.path());
        let engine = TemporalMemoryEngine::new(driver);
        let gateway = FakeGateway::default();

        gateway.push_json(entity_json("用户"));
        gateway.push_json(json!({"facts": []}));
        engine
            .add_episode("alice", "some body", SourceType::Text, Utc::now(), "chat", &gateway)
            .await
            .unwrap();

        engine.clear("alice").await.unwrap();
        let history = engine.get_all("alice").await.unwrap();
        assert!(history.is_empty());
    }
}
