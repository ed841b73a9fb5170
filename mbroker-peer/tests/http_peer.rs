//! Peer client and synchronizer against a mock peer API.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use mbroker_core::{
    BrokerAuditLogger, EventSink, LocalProject, MemoryStore, PermissionStore, ProjectPermission,
    ProjectRole,
};
use mbroker_peer::{
    HttpPeerClient, NewPeerProject, PeerClient, PeerError, PeerPermission, PeerProject,
    PermissionSynchronizer,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

const TOKEN: &str = "secret";

#[derive(Default)]
struct PeerState {
    projects: Vec<PeerProject>,
    users: HashMap<String, Vec<PeerPermission>>,
}

type Shared = Arc<Mutex<PeerState>>;

#[derive(Deserialize)]
struct ProjectFilter {
    backend_id: Option<String>,
}

#[derive(Deserialize)]
struct RemoveUser {
    username: String,
}

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    match headers.get("Authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == format!("Token {}", TOKEN) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn list_projects(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(filter): Query<ProjectFilter>,
) -> Result<Json<Vec<PeerProject>>, StatusCode> {
    authorized(&headers)?;
    let state = state.lock().unwrap();
    let projects = state
        .projects
        .iter()
        .filter(|p| filter.backend_id.as_deref().is_none_or(|b| p.backend_id == b))
        .cloned()
        .collect();
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<NewPeerProject>,
) -> Result<(StatusCode, Json<PeerProject>), StatusCode> {
    authorized(&headers)?;
    let mut state = state.lock().unwrap();
    let project = PeerProject {
        uuid: format!("peer-{}", state.projects.len() + 1),
        name: body.name,
        backend_id: body.backend_id,
    };
    state.projects.push(project.clone());
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_users(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Vec<PeerPermission>>, StatusCode> {
    authorized(&headers)?;
    let state = state.lock().unwrap();
    Ok(Json(state.users.get(&uuid).cloned().unwrap_or_default()))
}

async fn add_user(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
    Json(body): Json<PeerPermission>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    if body.username == "broken" {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.lock().unwrap().users.entry(uuid).or_default().push(body);
    Ok(StatusCode::CREATED)
}

async fn delete_user(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
    Json(body): Json<RemoveUser>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    state
        .lock()
        .unwrap()
        .users
        .entry(uuid)
        .or_default()
        .retain(|p| p.username != body.username);
    Ok(StatusCode::NO_CONTENT)
}

async fn spawn_peer(state: Shared) -> String {
    let router = Router::new()
        .route("/api/projects/", get(list_projects).post(create_project))
        .route("/api/projects/{uuid}/list_users/", get(list_users))
        .route("/api/projects/{uuid}/add_user/", post(add_user))
        .route("/api/projects/{uuid}/delete_user/", post(delete_user))
        .with_state(state);

    let port = portpicker::pick_unused_port().expect("No available port");
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_client_round_trips_project_and_users() {
    let state = Shared::default();
    let url = spawn_peer(state.clone()).await;
    let client = HttpPeerClient::new(&url, TOKEN).unwrap();

    assert_eq!(client.find_project("p1").await.unwrap(), None);
    let created = client
        .create_project(&NewPeerProject {
            name: "research".into(),
            description: String::new(),
            backend_id: "p1".into(),
            customer: "c1".into(),
        })
        .await
        .unwrap();
    assert_eq!(client.find_project("p1").await.unwrap(), Some(created.clone()));

    let alice = PeerPermission {
        username: "alice".into(),
        role: "admin".into(),
        expiration_time: None,
    };
    client.add_permission(&created.uuid, &alice).await.unwrap();
    assert_eq!(client.list_permissions(&created.uuid).await.unwrap(), vec![alice]);

    client
        .remove_permission(&created.uuid, "alice", "admin")
        .await
        .unwrap();
    assert!(client.list_permissions(&created.uuid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_token_surfaces_api_error() {
    let url = spawn_peer(Shared::default()).await;
    let client = HttpPeerClient::new(&url, "wrong").unwrap();

    match client.find_project("p1").await {
        Err(PeerError::Api { status, .. }) => assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED),
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_against_http_peer() {
    let state = Shared::default();
    {
        let mut peer = state.lock().unwrap();
        peer.projects.push(PeerProject {
            uuid: "peer-1".into(),
            name: "research".into(),
            backend_id: "p1".into(),
        });
        peer.users.insert(
            "peer-1".into(),
            vec![PeerPermission {
                username: "mallory".into(),
                role: "member".into(),
                expiration_time: None,
            }],
        );
    }
    let url = spawn_peer(state.clone()).await;

    let store = Arc::new(MemoryStore::new());
    store
        .put_project(LocalProject {
            id: "p1".into(),
            name: "research".into(),
            description: String::new(),
            linked: true,
        })
        .await
        .unwrap();
    for username in ["alice", "broken"] {
        store
            .grant(ProjectPermission {
                project_id: "p1".into(),
                username: username.into(),
                role: ProjectRole::Member,
                expiration_time: None,
            })
            .await
            .unwrap();
    }

    let synchronizer = PermissionSynchronizer::new(
        Arc::new(HttpPeerClient::new(&url, TOKEN).unwrap()),
        store,
        EventSink::new(Arc::new(BrokerAuditLogger::new_recording())),
        Vec::new(),
        "c1",
    );
    let report = synchronizer.sync_all().await.unwrap();
    assert_eq!(report.granted, 1);
    assert_eq!(report.revoked, 1);
    assert_eq!(report.failed, 1);

    let users: Vec<String> = state.lock().unwrap().users["peer-1"]
        .iter()
        .map(|p| p.username.clone())
        .collect();
    assert_eq!(users, vec!["alice"]);
}
