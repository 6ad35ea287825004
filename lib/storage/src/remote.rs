// Qdrant-compatible REST engine
use ahash::AHashMap;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use vizdex_core::{
    into_metadata, CollectionSchema, Distance, Error, FilterCondition, IndexParams, NormalizedVector,
    PayloadFilter, Record, Result, SearchHit,
};

use crate::engine::IndexEngine;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
    #[serde(default)]
    hnsw_config: Option<HnswConfig>,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Deserialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Deserialize)]
struct HnswConfig {
    m: usize,
    ef_construct: usize,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

/// Stable point id for a string key.
pub fn point_id(key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

fn metric_name(metric: Distance) -> &'static str {
    match metric {
        Distance::Cosine => "Cosine",
        Distance::Euclidean => "Euclid",
    }
}

fn parse_metric(name: &str) -> Result<Distance> {
    match name {
        "Cosine" => Ok(Distance::Cosine),
        "Euclid" => Ok(Distance::Euclidean),
        other => Err(Error::Storage(format!("unsupported remote distance '{other}'"))),
    }
}

fn field_key(field: &str) -> String {
    format!("metadata.{}", field.trim_start_matches('.'))
}

fn match_value(field: &str, value: &Value) -> Value {
    match value {
        Value::Null => json!({"is_null": {"key": field_key(field)}}),
        Value::Number(n) if n.is_f64() => json!({"key": field_key(field), "range": {"gte": n, "lte": n}}),
        other => json!({"key": field_key(field), "match": {"value": other}}),
    }
}

fn range(field: &str, op: &str, value: f64) -> Value {
    json!({"key": field_key(field), "range": {op: value}})
}

/// Translate a filter tree into Qdrant's `must` / `should` / `must_not` form.
///
/// Leaves sit directly in the clause lists; nested boolean nodes become nested filters.
pub fn translate_filter(condition: &FilterCondition) -> Value {
    match condition {
        FilterCondition::And(items) => json!({"must": items.iter().map(translate_clause).collect::<Vec<_>>()}),
        FilterCondition::Or(items) => json!({"should": items.iter().map(translate_clause).collect::<Vec<_>>()}),
        FilterCondition::Not(inner) => json!({"must_not": [translate_clause(inner)]}),
        leaf => json!({"must": [translate_clause(leaf)]}),
    }
}

/// One entry of a clause list.
fn translate_clause(condition: &FilterCondition) -> Value {
    match condition {
        FilterCondition::Equals { field, value } => match_value(field, value),
        FilterCondition::NotEquals { field, value } => json!({"must_not": [match_value(field, value)]}),
        FilterCondition::GreaterThan { field, value } => range(field, "gt", *value),
        FilterCondition::LessThan { field, value } => range(field, "lt", *value),
        FilterCondition::GreaterEqual { field, value } => range(field, "gte", *value),
        FilterCondition::LessEqual { field, value } => range(field, "lte", *value),
        FilterCondition::Contains { field, value } => json!({"should": [
            {"key": field_key(field), "match": {"value": value}},
            {"key": field_key(field), "match": {"text": value}},
        ]}),
        nested => translate_filter(nested),
    }
}

fn transport_err(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::Connection(e.to_string())
    } else {
        Error::Storage(e.to_string())
    }
}

/// Engine backed by a Qdrant server reached over REST.
pub struct RemoteEngine {
    client: Client,
    base_url: String,
    /// Query-time `hnsw_ef` per collection; the server does not store it.
    ef_search: RwLock<AHashMap<String, usize>>,
}

impl RemoteEngine {
    /// Build a client and check that the server answers.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host.trim_end_matches('/'), port)
        } else {
            format!("http://{host}:{port}")
        };
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        let engine = Self {
            client,
            base_url,
            ef_search: RwLock::new(AHashMap::new()),
        };

        engine
            .client
            .get(engine.url("/collections"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Connection(format!("{}: {}", engine.base_url, e)))?;
        info!("Connected to index server at {}", engine.base_url);
        Ok(engine)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn remember_ef(&self, name: &str, params: &IndexParams) {
        self.ef_search.write().insert(name.to_string(), params.ef_search);
    }

    fn search_ef(&self, name: &str, top_k: usize) -> usize {
        let ef = self
            .ef_search
            .read()
            .get(name)
            .copied()
            .unwrap_or(IndexParams::default().ef_search);
        ef.max(top_k)
    }

    async fn send_opt<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = request.send().await.map_err(transport_err)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Storage(format!("index server returned {status}: {body}")));
        }
        let envelope: Envelope<T> = response.json().await.map_err(transport_err)?;
        Ok(Some(envelope.result))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send_opt(request)
            .await?
            .ok_or_else(|| Error::NotFound("index server resource".to_string()))
    }
}

impl IndexEngine for RemoteEngine {
    async fn describe(&self, name: &str) -> Result<Option<CollectionSchema>> {
        let info: Option<CollectionInfo> = self
            .send_opt(self.client.get(self.url(&format!("/collections/{name}"))))
            .await?;
        let Some(info) = info else {
            return Ok(None);
        };
        let vectors = info.config.params.vectors;
        let mut schema = CollectionSchema::new(name, vectors.size, parse_metric(&vectors.distance)?);
        schema.index = info.config.hnsw_config.map(|h| IndexParams {
            m: h.m,
            ef_construction: h.ef_construct,
            ..IndexParams::default()
        });
        Ok(Some(schema))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let mut body = json!({
            "vectors": {"size": schema.dim, "distance": metric_name(schema.metric)},
        });
        if let Some(params) = schema.index {
            body["hnsw_config"] = json!({"m": params.m, "ef_construct": params.ef_construction});
            self.remember_ef(&schema.name, &params);
        }
        let _: Value = self
            .send(self.client.put(self.url(&format!("/collections/{}", schema.name))).json(&body))
            .await?;
        info!("Created remote collection '{}'", schema.name);
        Ok(())
    }

    async fn create_index(&self, name: &str, params: IndexParams, force: bool) -> Result<()> {
        self.remember_ef(name, &params);
        // The server always maintains an HNSW graph; only a forced rebuild changes it.
        if !force {
            return Ok(());
        }
        let body = json!({"hnsw_config": {"m": params.m, "ef_construct": params.ef_construction}});
        let _: Value = self
            .send(self.client.patch(self.url(&format!("/collections/{name}"))).json(&body))
            .await?;
        Ok(())
    }

    async fn load(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, name: &str, record: Record) -> Result<()> {
        let body = json!({"points": [{
            "id": point_id(&record.key),
            "vector": record.vector.as_slice(),
            "payload": {"key": record.key, "metadata": record.metadata},
        }]});
        let _: Value = self
            .send(
                self.client
                    .put(self.url(&format!("/collections/{name}/points?wait=true")))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn contains(&self, name: &str, key: &str) -> Result<bool> {
        let body = json!({"ids": [point_id(key)], "with_payload": false, "with_vector": false});
        let points: Vec<Value> = self
            .send(self.client.post(self.url(&format!("/collections/{name}/points"))).json(&body))
            .await?;
        Ok(!points.is_empty())
    }

    async fn delete(&self, name: &str, key: &str) -> Result<bool> {
        if !self.contains(name, key).await? {
            return Ok(false);
        }
        let body = json!({"points": [point_id(key)]});
        let _: Value = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/delete?wait=true")))
                    .json(&body),
            )
            .await?;
        Ok(true)
    }

    async fn search_batch(
        &self,
        name: &str,
        queries: Vec<NormalizedVector>,
        top_k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Vec<SearchHit>>> {
        if top_k == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        let filter = filter.map(|f| translate_filter(f.condition()));
        let ef = self.search_ef(name, top_k);
        let searches: Vec<Value> = queries
            .iter()
            .map(|q| {
                let mut search = json!({
                    "vector": q.as_slice(),
                    "limit": top_k,
                    "with_payload": true,
                    "params": {"hnsw_ef": ef},
                });
                if let Some(filter) = &filter {
                    search["filter"] = filter.clone();
                }
                search
            })
            .collect();

        let batches: Vec<Vec<ScoredPoint>> = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search/batch")))
                    .json(&json!({"searches": searches})),
            )
            .await?;
        debug!("Remote search on '{}' returned {} result lists", name, batches.len());

        Ok(batches
            .into_iter()
            .map(|points| points.into_iter().filter_map(scored_to_hit).collect())
            .collect())
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let result: CountResult = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/count")))
                    .json(&json!({"exact": true})),
            )
            .await?;
        Ok(result.count)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn scored_to_hit(point: ScoredPoint) -> Option<SearchHit> {
    let mut payload = point.payload?;
    let key = match payload.remove("key")? {
        Value::String(s) => s,
        _ => return None,
    };
    let metadata = payload.remove("metadata").map(into_metadata).unwrap_or_default();
    Some(SearchHit {
        key,
        metadata,
        score: point.score,
    })
}
