use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use wheel_core::{Category, PrizeEntry, PrizeId, PrizePatch, PrizeSpec, SpinRecord, Stock, UserAccount};

pub mod admin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod spin;
pub mod storage;

use admin::{AdminGateway, Stats};
use catalog::CatalogStore;
use config::Config;
use error::AppError;
use ledger::LedgerService;
use spin::SpinService;
use storage::{MemoryStorage, Storage, StorageError};

const ANONYMOUS_USER: &str = "anonymous";
const DEFAULT_LEADERBOARD_SIZE: usize = 10;
const MAX_LEADERBOARD_SIZE: usize = 100;
const ADMIN_MAC_KEY: &[u8] = b"wheel-admin-password";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    storage: Arc<dyn Storage>,
    catalog: CatalogStore,
    ledger: LedgerService,
    spins: SpinService,
    admin: AdminGateway,
    admin_password: Option<Arc<str>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            &Config::default(),
            Box::new(ChaCha8Rng::from_entropy()),
        )
    }
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, config: &Config, rng: Box<dyn RngCore + Send>) -> Self {
        let catalog = CatalogStore::new(storage.clone(), config.storage_retry);
        let ledger = LedgerService::new(
            storage.clone(),
            config.storage_retry,
            config.starting_balance,
            config.balance_policy,
        );
        Self {
            spins: SpinService::new(
                catalog.clone(),
                ledger.clone(),
                rng,
                config.spin_conflict_retries,
            ),
            admin: AdminGateway::new(catalog.clone(), ledger.clone()),
            admin_password: config.admin_password.as_deref().map(Arc::from),
            storage,
            catalog,
            ledger,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, AppError> {
        let storage: Arc<dyn Storage> = match &config.persist_path {
            Some(path) => Arc::new(MemoryStorage::with_persistence(path.clone()).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        let rng = config
            .spin_seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        let state = Self::new(storage, config, Box::new(rng));
        if config.seed_catalog {
            state.catalog.seed_defaults().await?;
        }
        Ok(state)
    }

    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.storage.flush().await
    }
}

pub fn app(state: AppState) -> Router {
    let ruleta = Router::new()
        .route("/items", get(get_items))
        .route("/girar", post(spin_wheel))
        .route("/usuarios/:user_id", get(get_user));

    let admin = Router::new()
        .route("/productos", get(list_products).post(create_product))
        .route("/productos/:id", put(update_product).delete(delete_product))
        .route("/estadisticas", get(get_stats))
        .route("/premios", get(list_awards))
        .route("/premios/:id", put(redeem_award))
        .route("/leaderboard", get(get_leaderboard))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/healthz", get(health))
        .nest("/api/ruleta", ruleta)
        .nest("/api/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.admin_password.as_deref() {
        let provided = request
            .headers()
            .get("x-admin-password")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !password_matches(provided, expected) {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

// Both sides go through the same MAC so the comparison is constant-time.
fn password_matches(provided: &str, expected: &str) -> bool {
    let mac_of = |text: &str| {
        let mut mac = HmacSha256::new_from_slice(ADMIN_MAC_KEY).ok()?;
        mac.update(text.as_bytes());
        Some(mac)
    };
    match (mac_of(provided), mac_of(expected)) {
        (Some(provided), Some(expected)) => provided
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn path<T>(param: Result<Path<T>, PathRejection>) -> Result<T, AppError> {
    param
        .map(|Path(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

// Missing field stays `None`; an explicit `null` becomes `Some(None)`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// Prizes are rendered in the field names the wheel and admin clients read.
#[derive(Debug, Serialize)]
struct PrizeView {
    id: PrizeId,
    nombre: String,
    text: String,
    tipo: Category,
    #[serde(rename = "type")]
    kind: Category,
    puntos: i64,
    stock: Stock,
    probabilidad: f64,
    activo: bool,
    disponible: bool,
    color: String,
    imagen_url: Option<String>,
}

impl From<&PrizeEntry> for PrizeView {
    fn from(prize: &PrizeEntry) -> Self {
        Self {
            id: prize.id,
            nombre: prize.label.clone(),
            text: prize.label.clone(),
            tipo: prize.category,
            kind: prize.category,
            puntos: prize.points_delta,
            stock: prize.stock,
            probabilidad: prize.weight,
            activo: prize.active,
            disponible: prize.is_drawable(),
            color: prize.color.clone(),
            imagen_url: prize.image_url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ItemsResponse {
    items: Vec<PrizeView>,
}

#[derive(Debug, Default, Deserialize)]
struct SpinRequest {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SpinResponse {
    resultado: PrizeView,
    puntos_actuales: i64,
    giros_realizados: u64,
    user_id: String,
}

#[derive(Debug, Serialize)]
struct AccountView {
    user_id: String,
    puntos: i64,
    giros_realizados: u64,
    ultimo_giro: Option<u64>,
}

impl From<UserAccount> for AccountView {
    fn from(account: UserAccount) -> Self {
        Self {
            user_id: account.user_id,
            puntos: account.points_balance,
            giros_realizados: account.spin_count,
            ultimo_giro: account.last_spin_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct AwardView {
    id: u64,
    usuario_id: String,
    producto_id: PrizeId,
    producto_nombre: String,
    producto_tipo: Category,
    producto_puntos: i64,
    puntos_despues: i64,
    fecha_obtencion: u64,
    canjeado: bool,
    fecha_canje: Option<u64>,
}

impl From<SpinRecord> for AwardView {
    fn from(record: SpinRecord) -> Self {
        Self {
            id: record.id,
            usuario_id: record.user_id,
            producto_id: record.prize_id,
            producto_nombre: record.label,
            producto_tipo: record.category,
            producto_puntos: record.points_delta,
            puntos_despues: record.balance_after,
            fecha_obtencion: record.timestamp,
            canjeado: record.redeemed_at.is_some(),
            fecha_canje: record.redeemed_at,
        }
    }
}

fn default_tipo() -> String {
    Category::Prize.as_str().to_string()
}

fn default_stock() -> Option<i64> {
    Some(1)
}

fn default_probabilidad() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct ProductRequest {
    #[serde(default, alias = "text", alias = "label")]
    nombre: String,
    #[serde(default = "default_tipo", alias = "type", alias = "category")]
    tipo: String,
    #[serde(default, alias = "points_delta")]
    puntos: i64,
    #[serde(default = "default_stock")]
    stock: Option<i64>,
    #[serde(default = "default_probabilidad", alias = "weight")]
    probabilidad: f64,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    imagen_url: Option<String>,
}

impl TryFrom<ProductRequest> for PrizeSpec {
    type Error = AppError;

    fn try_from(req: ProductRequest) -> Result<Self, Self::Error> {
        Ok(PrizeSpec {
            label: req.nombre,
            category: req.tipo.parse()?,
            points_delta: req.puntos,
            stock: req.stock,
            weight: req.probabilidad,
            color: req.color,
            image_url: req.imagen_url,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProductPatchRequest {
    #[serde(default, alias = "text", alias = "label")]
    nombre: Option<String>,
    #[serde(default, alias = "type", alias = "category")]
    tipo: Option<String>,
    #[serde(default, alias = "points_delta")]
    puntos: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    stock: Option<Option<i64>>,
    #[serde(default, alias = "weight")]
    probabilidad: Option<f64>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, alias = "active")]
    activo: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    imagen_url: Option<Option<String>>,
}

impl TryFrom<ProductPatchRequest> for PrizePatch {
    type Error = AppError;

    fn try_from(req: ProductPatchRequest) -> Result<Self, Self::Error> {
        Ok(PrizePatch {
            label: req.nombre,
            category: req.tipo.map(|t| t.parse()).transpose()?,
            points_delta: req.puntos,
            stock: req.stock,
            weight: req.probabilidad,
            color: req.color,
            active: req.activo,
            image_url: req.imagen_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AwardsParams {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeaderboardParams {
    limit: Option<usize>,
}

async fn health() -> &'static str {
    "ok"
}

async fn get_items(State(state): State<AppState>) -> Result<Json<ItemsResponse>, AppError> {
    let items = state
        .catalog
        .list()
        .await?
        .iter()
        .filter(|p| p.active)
        .map(PrizeView::from)
        .collect();
    Ok(Json(ItemsResponse { items }))
}

async fn spin_wheel(
    State(state): State<AppState>,
    payload: Result<Json<SpinRequest>, JsonRejection>,
) -> Result<Json<SpinResponse>, AppError> {
    let request = body(payload)?;
    let user_id = request
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());

    let outcome = state.spins.spin(&user_id).await?;
    Ok(Json(SpinResponse {
        resultado: PrizeView::from(&outcome.prize),
        puntos_actuales: outcome.new_balance,
        giros_realizados: outcome.spin_count,
        user_id: outcome.user_id,
    }))
}

async fn get_user(
    State(state): State<AppState>,
    user_id: Result<Path<String>, PathRejection>,
) -> Result<Json<AccountView>, AppError> {
    let user_id = path(user_id)?;
    let account = state.ledger.account_or_default(&user_id).await?;
    Ok(Json(AccountView::from(account)))
}

async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<PrizeView>>, AppError> {
    let products = state.admin.list_products().await?;
    Ok(Json(products.iter().map(PrizeView::from).collect()))
}

async fn create_product(
    State(state): State<AppState>,
    payload: Result<Json<ProductRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let spec = PrizeSpec::try_from(body(payload)?)?;
    let created = state.admin.create_product(spec).await?;
    Ok((StatusCode::CREATED, Json(PrizeView::from(&created))))
}

async fn update_product(
    State(state): State<AppState>,
    id: Result<Path<PrizeId>, PathRejection>,
    payload: Result<Json<ProductPatchRequest>, JsonRejection>,
) -> Result<Json<PrizeView>, AppError> {
    let id = path(id)?;
    let patch = PrizePatch::try_from(body(payload)?)?;
    let updated = state.admin.update_product(id, patch).await?;
    Ok(Json(PrizeView::from(&updated)))
}

async fn delete_product(
    State(state): State<AppState>,
    id: Result<Path<PrizeId>, PathRejection>,
) -> Result<StatusCode, AppError> {
    let id = path(id)?;
    state.admin.delete_product(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<Stats>, AppError> {
    Ok(Json(state.admin.stats().await?))
}

async fn list_awards(
    State(state): State<AppState>,
    params: Result<Query<AwardsParams>, QueryRejection>,
) -> Result<Json<Vec<AwardView>>, AppError> {
    let params = query(params)?;
    let awards = state.admin.awards(params.user_id.as_deref()).await?;
    Ok(Json(awards.into_iter().map(AwardView::from).collect()))
}

async fn redeem_award(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Json<AwardView>, AppError> {
    let id = path(id)?;
    let redeemed = state.admin.redeem_award(id).await?;
    Ok(Json(AwardView::from(redeemed)))
}

async fn get_leaderboard(
    State(state): State<AppState>,
    params: Result<Query<LeaderboardParams>, QueryRejection>,
) -> Result<Json<Vec<AccountView>>, AppError> {
    let params = query(params)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_SIZE)
        .clamp(1, MAX_LEADERBOARD_SIZE);
    let board = state.admin.leaderboard(limit).await?;
    Ok(Json(board.into_iter().map(AccountView::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use rand::rngs::mock::StepRng;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Always rolls 0.0, so the lowest drawable id wins every spin.
    fn test_app() -> (Router, AppState) {
        test_app_with(Arc::new(MemoryStorage::new()), Config::default())
    }

    fn test_app_with(storage: Arc<dyn Storage>, config: Config) -> (Router, AppState) {
        let state = AppState::new(storage, &config, Box::new(StepRng::new(0, 0)));
        (app(state.clone()), state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn create(app: &Router, body: serde_json::Value) -> serde_json::Value {
        let res = app
            .clone()
            .oneshot(post_json("/api/admin/productos", body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await
    }

    async fn spin(app: &Router, user_id: &str) -> axum::response::Response {
        app.clone()
            .oneshot(post_json("/api/ruleta/girar", json!({ "user_id": user_id })))
            .await
            .unwrap()
    }

    async fn major_and_nothing(app: &Router) {
        create(
            app,
            json!({ "nombre": "Major", "tipo": "prize", "puntos": 100, "stock": 1, "probabilidad": 1 }),
        )
        .await;
        create(
            app,
            json!({ "nombre": "Nothing", "tipo": "bonus", "puntos": 0, "stock": null, "probabilidad": 99 }),
        )
        .await;
    }

    #[tokio::test]
    async fn major_prize_pays_out_once_then_leaves_the_draw() {
        let (app, _) = test_app();
        major_and_nothing(&app).await;

        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["resultado"]["id"], 1);
        assert_eq!(body["resultado"]["nombre"], "Major");
        assert_eq!(body["resultado"]["text"], "Major");
        assert_eq!(body["resultado"]["puntos"], 100);
        assert_eq!(body["resultado"]["tipo"], "prize");
        assert_eq!(body["puntos_actuales"], 200);
        assert_eq!(body["user_id"], "u1");
        assert_eq!(body["resultado"]["stock"], 0);
        assert_eq!(body["resultado"]["disponible"], false);

        for _ in 0..3 {
            let body = json_body(spin(&app, "u1").await).await;
            assert_eq!(body["resultado"]["id"], 2);
            assert_eq!(body["puntos_actuales"], 200);
        }

        let items = json_body(app.clone().oneshot(get("/api/ruleta/items")).await.unwrap()).await;
        let items = items["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["stock"], 0);
        assert_eq!(items[0]["disponible"], false);
        assert_eq!(items[1]["stock"], serde_json::Value::Null);
        assert_eq!(items[1]["disponible"], true);

        let user = json_body(app.clone().oneshot(get("/api/ruleta/usuarios/u1")).await.unwrap()).await;
        assert_eq!(user["puntos"], 200);
        assert_eq!(user["giros_realizados"], 4);
    }

    #[tokio::test]
    async fn spin_without_prizes_reports_error_field() {
        let (app, state) = test_app();
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await, json!({ "error": "no prizes available" }));
        assert!(state.ledger.account("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spin_defaults_to_anonymous_user() {
        let (app, _) = test_app();
        major_and_nothing(&app).await;
        let res = app
            .clone()
            .oneshot(post_json("/api/ruleta/girar", json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(res).await["user_id"], "anonymous");
    }

    #[tokio::test]
    async fn items_hide_inactive_prizes() {
        let (app, _) = test_app();
        major_and_nothing(&app).await;
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri("/api/admin/productos/1")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "activo": false }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["activo"], false);

        let items = json_body(app.clone().oneshot(get("/api/ruleta/items")).await.unwrap()).await;
        let ids: Vec<i64> = items["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2]);

        let all = json_body(app.clone().oneshot(get("/api/admin/productos")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let body = json_body(spin(&app, "u1").await).await;
        assert_eq!(body["resultado"]["id"], 2);
    }

    #[tokio::test]
    async fn admin_validation_and_not_found() {
        let (app, _) = test_app();

        let res = app
            .clone()
            .oneshot(post_json("/api/admin/productos", json!({ "label": "", "weight": 1 })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "label must not be empty");

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/admin/productos",
                json!({ "nombre": "Bad", "probabilidad": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/admin/productos",
                json!({ "nombre": "Bad", "tipo": "jackpot" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "unknown category: jackpot");

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/admin/productos")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["error"].is_string());

        let res = app.clone().oneshot(delete("/api/admin/productos/999")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(res).await["error"], "prize 999 not found");

        let res = app.clone().oneshot(delete("/api/admin/productos/abc")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_defaults_and_delete_twice() {
        let (app, _) = test_app();
        let created = create(&app, json!({ "text": "Giro Extra", "type": "bonus" })).await;
        assert_eq!(created["stock"], 1);
        assert_eq!(created["probabilidad"], 1.0);
        assert_eq!(created["color"], "#4CAF50");
        assert_eq!(created["tipo"], "bonus");
        assert_eq!(created["activo"], true);

        let res = app.clone().oneshot(delete("/api/admin/productos/1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = app.clone().oneshot(delete("/api/admin/productos/1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_leaderboard_and_awards() {
        let (app, _) = test_app();
        major_and_nothing(&app).await;
        spin(&app, "alice").await;
        spin(&app, "bob").await;
        spin(&app, "bob").await;

        let stats = json_body(app.clone().oneshot(get("/api/admin/estadisticas")).await.unwrap()).await;
        assert_eq!(
            stats,
            json!({
                "total_usuarios": 2,
                "total_giros": 3,
                "productos_activos": 2,
                "productos_disponibles": 1
            })
        );

        let board = json_body(app.clone().oneshot(get("/api/admin/leaderboard")).await.unwrap()).await;
        assert_eq!(board[0]["user_id"], "alice");
        assert_eq!(board[0]["puntos"], 200);
        assert_eq!(board[1]["user_id"], "bob");
        assert_eq!(board[1]["giros_realizados"], 2);

        let res = app.clone().oneshot(get("/api/admin/leaderboard?limit=lots")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["error"].is_string());

        let awards = json_body(app.clone().oneshot(get("/api/admin/premios?user_id=bob")).await.unwrap()).await;
        let awards = awards.as_array().unwrap();
        assert_eq!(awards.len(), 2);
        assert_eq!(awards[0]["producto_nombre"], "Nothing");
        assert_eq!(awards[0]["usuario_id"], "bob");
    }

    #[tokio::test]
    async fn unknown_user_reports_starting_balance() {
        let (app, state) = test_app();
        let user = json_body(app.clone().oneshot(get("/api/ruleta/usuarios/nobody")).await.unwrap()).await;
        assert_eq!(user["puntos"], 100);
        assert_eq!(user["giros_realizados"], 0);
        assert!(state.ledger.account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn admin_routes_require_password_when_configured() {
        let config = Config {
            admin_password: Some("changeme".into()),
            ..Config::default()
        };
        let (app, _) = test_app_with(Arc::new(MemoryStorage::new()), config);

        let res = app.clone().oneshot(get("/api/admin/productos")).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(res).await["error"], "invalid admin password");

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/admin/productos")
                    .header("x-admin-password", "changeme")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        // The player surface stays open.
        let res = app.clone().oneshot(get("/api/ruleta/items")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_account_writes: AtomicBool,
        fail_spin_appends: AtomicBool,
        transient_list_failures: AtomicU32,
    }

    impl FlakyStorage {
        fn down() -> StorageError {
            StorageError::Unavailable("injected".into())
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn list_prizes(&self) -> Result<Vec<PrizeEntry>, StorageError> {
            let remaining = self.transient_list_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_list_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::down());
            }
            self.inner.list_prizes().await
        }
        async fn get_prize(&self, id: PrizeId) -> Result<Option<PrizeEntry>, StorageError> {
            self.inner.get_prize(id).await
        }
        async fn put_prize(&self, prize: PrizeEntry) -> Result<(), StorageError> {
            self.inner.put_prize(prize).await
        }
        async fn delete_prize(&self, id: PrizeId) -> Result<bool, StorageError> {
            self.inner.delete_prize(id).await
        }
        async fn next_prize_id(&self) -> Result<PrizeId, StorageError> {
            self.inner.next_prize_id().await
        }
        async fn list_accounts(&self) -> Result<Vec<UserAccount>, StorageError> {
            self.inner.list_accounts().await
        }
        async fn get_account(&self, user_id: &str) -> Result<Option<UserAccount>, StorageError> {
            self.inner.get_account(user_id).await
        }
        async fn put_account(&self, account: UserAccount) -> Result<(), StorageError> {
            if self.fail_account_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put_account(account).await
        }
        async fn delete_account(&self, user_id: &str) -> Result<bool, StorageError> {
            self.inner.delete_account(user_id).await
        }
        async fn list_spins(&self) -> Result<Vec<SpinRecord>, StorageError> {
            self.inner.list_spins().await
        }
        async fn get_spin(&self, id: u64) -> Result<Option<SpinRecord>, StorageError> {
            self.inner.get_spin(id).await
        }
        async fn put_spin(&self, record: SpinRecord) -> Result<(), StorageError> {
            self.inner.put_spin(record).await
        }
        async fn append_spin(&self, record: SpinRecord) -> Result<SpinRecord, StorageError> {
            if self.fail_spin_appends.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append_spin(record).await
        }
    }

    #[tokio::test]
    async fn failed_ledger_write_restores_stock() {
        let storage = Arc::new(FlakyStorage::default());
        let (app, state) = test_app_with(storage.clone(), Config::default());
        major_and_nothing(&app).await;

        storage.fail_account_writes.store(true, Ordering::SeqCst);
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(res).await["error"], "internal server error");

        assert_eq!(state.catalog.get(1).await.unwrap().stock, Stock::Limited(1));
        assert!(state.ledger.account("u1").await.unwrap().is_none());
        assert!(state.ledger.history(None).await.unwrap().is_empty());

        storage.fail_account_writes.store(false, Ordering::SeqCst);
        let body = json_body(spin(&app, "u1").await).await;
        assert_eq!(body["resultado"]["id"], 1);
        assert_eq!(body["puntos_actuales"], 200);
    }

    #[tokio::test]
    async fn failed_history_append_restores_account_and_stock() {
        let storage = Arc::new(FlakyStorage::default());
        let (app, state) = test_app_with(storage.clone(), Config::default());
        create(
            &app,
            json!({ "nombre": "Five", "puntos": 5, "stock": 3, "probabilidad": 1 }),
        )
        .await;
        spin(&app, "u1").await;

        storage.fail_spin_appends.store(true, Ordering::SeqCst);
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let account = state.ledger.account("u1").await.unwrap().unwrap();
        assert_eq!(account.points_balance, 105);
        assert_eq!(account.spin_count, 1);
        assert_eq!(state.catalog.get(1).await.unwrap().stock, Stock::Limited(2));
        assert_eq!(state.ledger.history(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried() {
        let storage = Arc::new(FlakyStorage::default());
        let mut config = Config::default();
        config.storage_retry.base_delay = std::time::Duration::from_millis(1);
        let (app, _) = test_app_with(storage.clone(), config);
        major_and_nothing(&app).await;

        storage.transient_list_failures.store(2, Ordering::SeqCst);
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::OK);

        storage.transient_list_failures.store(10, Ordering::SeqCst);
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_oversell() {
        let (app, state) = test_app();
        major_and_nothing(&app).await;

        let mut handles = Vec::new();
        for n in 0..24 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                let res = spin(&app, &format!("user-{n}")).await;
                assert_eq!(res.status(), StatusCode::OK);
                json_body(res).await["resultado"]["id"].as_i64().unwrap()
            }));
        }
        let mut majors = 0;
        for handle in handles {
            if handle.await.unwrap() == 1 {
                majors += 1;
            }
        }
        assert_eq!(majors, 1);
        assert_eq!(state.catalog.get(1).await.unwrap().stock, Stock::Limited(0));
    }

    #[tokio::test]
    async fn persisted_state_survives_restart() {
        let path = std::env::temp_dir().join(format!("wheel_state_{}.json", Uuid::new_v4()));
        let config = Config {
            persist_path: Some(path.clone()),
            spin_seed: Some(7),
            ..Config::default()
        };

        let state = AppState::from_config(&config).await.unwrap();
        let app = app(state.clone());
        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::OK);
        state.shutdown().await.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_ok());

        let reloaded = AppState::from_config(&config).await.unwrap();
        assert_eq!(reloaded.catalog.list().await.unwrap().len(), 5);
        let account = reloaded.ledger.account("u1").await.unwrap().unwrap();
        assert_eq!(account.spin_count, 1);
        assert_eq!(reloaded.ledger.history(None).await.unwrap().len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(path.with_extension("spins.jsonl")).await;
    }

    #[tokio::test]
    async fn oversized_weights_are_rejected_and_never_break_spins() {
        let (app, _) = test_app();
        for _ in 0..2 {
            let res = app
                .clone()
                .oneshot(post_json(
                    "/api/admin/productos",
                    json!({ "nombre": "Huge", "probabilidad": 1e308, "stock": null }),
                ))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        }

        create(&app, json!({ "nombre": "Capped", "probabilidad": 1e9, "stock": null })).await;
        create(&app, json!({ "nombre": "Also", "probabilidad": 1e9, "stock": null })).await;
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri("/api/admin/productos/1")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "probabilidad": 1e308 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = spin(&app, "u1").await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    fn put(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn awards_can_be_redeemed_once() {
        let (app, state) = test_app();
        major_and_nothing(&app).await;
        spin(&app, "u1").await;

        let res = app.clone().oneshot(put("/api/admin/premios/1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let award = json_body(res).await;
        assert_eq!(award["canjeado"], true);
        assert!(award["fecha_canje"].is_u64());
        assert_eq!(award["producto_nombre"], "Major");

        let res = app.clone().oneshot(put("/api/admin/premios/1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(res).await["error"], "award 1 was already redeemed");

        let res = app.clone().oneshot(put("/api/admin/premios/77")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let awards = json_body(app.clone().oneshot(get("/api/admin/premios")).await.unwrap()).await;
        assert_eq!(awards[0]["canjeado"], true);
        let account = state.ledger.account("u1").await.unwrap().unwrap();
        assert_eq!(account.points_balance, 200);
    }

    #[test]
    fn password_check_matches_exactly() {
        assert!(password_matches("changeme", "changeme"));
        assert!(!password_matches("changem", "changeme"));
        assert!(!password_matches("", "changeme"));
        assert!(!password_matches("changeme ", "changeme"));
    }
}
