//! Command dispatcher: the single external entry point coordinating store
//! mutation, AOL durability, geofence evaluation, and notification fanout
//! (spec §4.5).
//!
//! Three lock disciplines, exactly as specified: **Writes** take
//! `server.store.write()` and append to the AOL before replying; **Reads**
//! take `server.store.read()` and never touch the AOL; **System** commands
//! (`CONFIG`, `AUTH`, `PING`, ...) touch neither the store nor the AOL.
//! Grounded on `commands/run.rs`'s worker-pool-over-channel pattern,
//! generalized here to "one write path serialized by a single lock" since
//! the spec's single-writer/many-reader semantics come from the lock
//! itself rather than from a queue.

use crate::command::{self, AreaSpec, Command, ConfigAction, FenceArgs, OutputFormat, ScanArgs, SearchArgs, SearchKind};
use crate::error::{CommandError, CommandResult};
use crate::geofence_engine::{self, FenceEvent};
use crate::geometry::Geometry;
use crate::hook::{Delivery, Fence, FenceKind, Hook, OutputMode};
use crate::object::{Object, Value};
use crate::scan_writer;
use crate::server::Server;
use serde_json::{Value as Json, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Commands that mutate the collection/hook store and must be durably
/// logged before the response is sent (spec §4.5 "Writes").
fn is_write(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::Set(_)
            | Command::Fset { .. }
            | Command::Del { .. }
            | Command::Pdel { .. }
            | Command::Drop { .. }
            | Command::FlushDb
            | Command::Rename { .. }
            | Command::Expire { .. }
            | Command::Persist { .. }
            | Command::SetHook { .. }
            | Command::SetChan { .. }
            | Command::DelHook { .. }
            | Command::PdelHook { .. }
            | Command::AofShrink
            | Command::Jset { .. }
            | Command::Jdel { .. }
    )
}

/// System commands touch neither the store nor the AOL (spec §4.5
/// "System").
fn is_system(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::Config { .. }
            | Command::Auth { .. }
            | Command::Output(_)
            | Command::Ping
            | Command::Quit
            | Command::ReadOnly(_)
            | Command::Follow { .. }
            | Command::Aof { .. }
            | Command::AofMd5 { .. }
            | Command::Stats { .. }
            | Command::Subscribe { .. }
            | Command::Psubscribe { .. }
            | Command::Publish { .. }
            | Command::Client { .. }
            | Command::Replconf
            | Command::Info
            | Command::Server
            | Command::Chans { .. }
    )
}

/// A single connection's session state: output format and auth status,
/// kept outside `Server` since it's per-connection (spec §4.5).
#[derive(Default)]
pub struct Session {
    pub authenticated: bool,
    pub output: OutputFormat,
}

/// Parse and execute one command frame, returning the JSON response body.
pub async fn execute(server: &Arc<Server>, session: &mut Session, args: Vec<String>) -> CommandResult<Json> {
    let cmd = command::parse_frame(args.clone())?;

    if server.authenticated_password.is_some() && !session.authenticated && !matches!(cmd, Command::Auth { .. } | Command::Ping) {
        return Err(CommandError::AuthRequired);
    }

    if is_write(&cmd) {
        if server.is_read_only() {
            return Err(CommandError::ReadOnly);
        }
        let config = server.config.read().await;
        if config.maxmemory_bytes > 0 && server.aol.size() > config.maxmemory_bytes {
            server.counters.reads_rejected_oom.fetch_add(1, Ordering::Relaxed);
            return Err(CommandError::OutOfMemory);
        }
        drop(config);
        let response = execute_write(server, &cmd, false).await?;
        // AOFSHRINK already rewrote the whole log as a fresh baseline;
        // logging the AOFSHRINK frame itself on top of that would be
        // meaningless on the next replay.
        if !matches!(cmd, Command::AofShrink) {
            server.aol.append(&args).await.map_err(|e| {
                warn!(error = %e, "AOL append failed");
                CommandError::Syntax("durability failure".into())
            })?;
        }
        server.counters.commands_processed.fetch_add(1, Ordering::Relaxed);
        return Ok(response);
    }

    if is_system(&cmd) {
        return execute_system(server, session, cmd).await;
    }

    execute_read(server, &cmd).await
}

/// Apply every frame from AOL replay directly to the store, skipping
/// durability (already on disk) and fence/outbox side effects (spec §4.2.2
/// "replay re-applies mutations"; notifications are not re-delivered for
/// already-seen history). Errors the replayed command wouldn't tolerate at
/// steady state (anything but a stale key/id) abort the whole replay: the
/// log is presumed internally consistent, so such an error means the file
/// is corrupt rather than something safe to paper over (spec §4.2.2, §7).
pub async fn replay(server: &Arc<Server>, frames: Vec<Vec<String>>) -> anyhow::Result<()> {
    for args in frames {
        let cmd = match command::parse_frame(args) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "skipping unparseable AOL frame during replay");
                continue;
            }
        };
        if let Err(e) = execute_write(server, &cmd, true).await {
            if e.is_replay_tolerable() {
                warn!(error = %e, "tolerable error during AOL replay, continuing");
                continue;
            }
            return Err(e.into());
        }
    }
    Ok(())
}

async fn execute_write(server: &Arc<Server>, cmd: &Command, replaying: bool) -> CommandResult<Json> {
    match cmd {
        Command::Set(set_args) => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(&set_args.key);
            let prev = collection.get(&set_args.id).cloned();
            let prev_geom = prev.as_ref().and_then(|o| o.value.as_geometry()).cloned();

            if matches!(set_args.nx_xx, command::NxXx::Nx) && prev.is_some() {
                return Err(CommandError::Syntax("NX set but id exists".into()));
            }
            if matches!(set_args.nx_xx, command::NxXx::Xx) && prev.is_none() {
                return Err(CommandError::IdNotFound);
            }

            let mut fields = prev.as_ref().map(|o| o.fields.clone()).unwrap_or_default();
            for (name, value) in &set_args.fields {
                fields.set(name, value.clone());
            }
            let expires_at = set_args
                .ex
                .map(|secs| crate::collection::now_nanos() + (secs * 1_000_000_000.0) as i64)
                .unwrap_or(0);

            let object = Object {
                id: set_args.id.clone(),
                value: set_args.value.clone(),
                expires_at,
                fields,
            };
            collection.set(object.clone());
            drop(store);

            if !replaying {
                dispatch_fences(server, &set_args.key, &object, prev_geom.as_ref(), false).await;
            }
            Ok(json!({ "ok": true }))
        }

        Command::Fset { key, id, xx, fields } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let Some(existing) = collection.get(id).cloned() else {
                if *xx {
                    return Ok(json!({ "ok": true }));
                }
                return Err(CommandError::IdNotFound);
            };
            let prev_geom = existing.value.as_geometry().cloned();
            let mut updated = existing.clone();
            for (name, value) in fields {
                updated.fields.set(name, value.clone());
            }
            collection.set(updated.clone());
            drop(store);

            if !replaying {
                dispatch_fences(server, key, &updated, prev_geom.as_ref(), true).await;
            }
            Ok(json!({ "ok": true }))
        }

        Command::Del { key, id, erron404 } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let removed = collection.delete(id);
            let empty = collection.is_empty();
            if empty {
                store.drop_if_empty(key);
            }
            drop(store);
            match removed {
                Some(obj) => {
                    if !replaying {
                        let mut hooks = server.hooks.write().await;
                        let events = geofence_engine::evaluate_delete(&mut hooks, key, &obj);
                        drop(hooks);
                        deliver(server, events).await;
                    }
                    Ok(json!({ "ok": true }))
                }
                None if *erron404 => Err(CommandError::IdNotFound),
                None => Ok(json!({ "ok": true })),
            }
        }

        Command::Pdel { key, pattern } => {
            let re = command::glob_to_regex(pattern);
            let mut store = server.store.write().await;
            let Some(collection) = store.0.get_mut(key) else {
                return Ok(json!({ "ok": true, "deleted": 0 }));
            };
            let mut ids = Vec::new();
            collection
                .scan(false, 0, crate::collection::Deadline::NONE, |obj| {
                    if re.is_match(&obj.id) {
                        ids.push(obj.id.clone());
                    }
                    true
                })
                .ok();
            let mut removed = Vec::new();
            for id in &ids {
                if let Some(obj) = collection.delete(id) {
                    removed.push(obj);
                }
            }
            store.drop_if_empty(key);
            drop(store);
            if !replaying {
                let mut hooks = server.hooks.write().await;
                let mut events = Vec::new();
                for obj in &removed {
                    events.extend(geofence_engine::evaluate_delete(&mut hooks, key, obj));
                }
                drop(hooks);
                deliver(server, events).await;
            }
            Ok(json!({ "ok": true, "deleted": removed.len() }))
        }

        Command::Drop { key } => {
            let mut store = server.store.write().await;
            store.0.remove(key);
            Ok(json!({ "ok": true }))
        }

        Command::FlushDb => {
            let mut store = server.store.write().await;
            store.0.clear();
            let mut hooks = server.hooks.write().await;
            *hooks = crate::hook_registry::HookRegistry::new();
            Ok(json!({ "ok": true }))
        }

        Command::Rename { key, new_key, nx } => {
            let mut store = server.store.write().await;
            if *nx && store.0.contains_key(new_key) {
                return Err(CommandError::Syntax("NX rename but new key exists".into()));
            }
            let Some(collection) = store.0.remove(key) else {
                return Err(CommandError::KeyNotFound);
            };
            store.0.insert(new_key.clone(), collection);
            Ok(json!({ "ok": true }))
        }

        Command::Expire { key, id, seconds } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let Some(mut object) = collection.get(id).cloned() else {
                return Err(CommandError::IdNotFound);
            };
            object.expires_at = crate::collection::now_nanos() + (*seconds * 1_000_000_000.0) as i64;
            collection.set(object);
            Ok(json!({ "ok": true }))
        }

        Command::Persist { key, id } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let Some(mut object) = collection.get(id).cloned() else {
                return Err(CommandError::IdNotFound);
            };
            object.expires_at = 0;
            collection.set(object);
            Ok(json!({ "ok": true }))
        }

        Command::SetHook { name, endpoints, fence } => {
            let hook = hook_from_args(server, name.clone(), endpoints.clone(), fence.clone()).await?;
            server.hooks.write().await.insert(hook);
            if !replaying {
                server.spawn_hook_worker(name.clone(), endpoints.clone()).await;
            }
            Ok(json!({ "ok": true }))
        }

        Command::SetChan { name, channel, fence } => {
            let mut hook = hook_from_args(server, name.clone(), vec![], fence.clone()).await?;
            hook.delivery = Delivery::Channel(channel.clone());
            server.hooks.write().await.insert(hook);
            Ok(json!({ "ok": true }))
        }

        Command::DelHook { name } => {
            server.hooks.write().await.remove(name);
            if !replaying {
                server.cancel_hook_worker(name).await;
            }
            Ok(json!({ "ok": true }))
        }

        Command::PdelHook { pattern } => {
            let mut hooks = server.hooks.write().await;
            let names = hooks.matching(pattern);
            for name in &names {
                hooks.remove(name);
            }
            drop(hooks);
            if !replaying {
                for name in &names {
                    server.cancel_hook_worker(name).await;
                }
            }
            Ok(json!({ "ok": true, "deleted": names.len() }))
        }

        Command::Jset { key, id, path, value, raw } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let mut obj = collection
                .get(id)
                .cloned()
                .unwrap_or_else(|| Object::new(id.clone(), Value::Str("{}".to_string())));
            let mut doc: Json = obj.value.as_str().and_then(|s| serde_json::from_str(s).ok()).unwrap_or_else(|| json!({}));
            let parsed = if *raw {
                Json::String(value.clone())
            } else {
                serde_json::from_str(value).unwrap_or_else(|_| Json::String(value.clone()))
            };
            crate::jsonpath::set(&mut doc, path, parsed);
            obj.value = Value::Str(doc.to_string());
            collection.set(obj);
            Ok(json!({ "ok": true }))
        }

        Command::Jdel { key, id, path } => {
            let mut store = server.store.write().await;
            let collection = store.get_or_create(key);
            let Some(mut obj) = collection.get(id).cloned() else {
                return Err(CommandError::IdNotFound);
            };
            let mut doc: Json = obj.value.as_str().and_then(|s| serde_json::from_str(s).ok()).ok_or(CommandError::PathNotFound)?;
            if !crate::jsonpath::del(&mut doc, path) {
                return Err(CommandError::PathNotFound);
            }
            obj.value = Value::Str(doc.to_string());
            collection.set(obj);
            Ok(json!({ "ok": true }))
        }

        Command::AofShrink => {
            let store = server.store.read().await;
            let snapshot: Vec<(String, Vec<String>)> = store
                .0
                .iter()
                .flat_map(|(key, collection)| {
                    let key = key.clone();
                    let mut rows = Vec::new();
                    collection
                        .scan(false, 0, crate::collection::Deadline::NONE, |obj| {
                            rows.push((key.clone(), set_frame(&key, obj)));
                            true
                        })
                        .ok();
                    rows
                })
                .collect();
            drop(store);
            server
                .aol
                .shrink(snapshot.into_iter())
                .await
                .map_err(|_| CommandError::Syntax("shrink failed".into()))?;
            Ok(json!({ "ok": true }))
        }

        _ => unreachable!("non-write command routed to execute_write"),
    }
}

/// Resolve an area argument against the store. Acquires and releases its
/// own short-lived read guard rather than sharing one with the caller's
/// scan/fence-build guard, so a `GET`-area lookup can never be held open
/// across a second, unrelated read acquisition on the same task.
async fn resolve_area(server: &Arc<Server>, area: &AreaSpec) -> CommandResult<Geometry> {
    match area {
        AreaSpec::Literal(g) => Ok(g.clone()),
        AreaSpec::Ref { key, id } => {
            let store = server.store.read().await;
            let collection = store.get(key).ok_or(CommandError::KeyNotFound)?;
            let obj = collection.get(id).ok_or(CommandError::IdNotFound)?;
            obj.value
                .as_geometry()
                .cloned()
                .ok_or_else(|| CommandError::Syntax("GET area references a non-geometry object".into()))
        }
    }
}

/// Build the `Fence` a `SETHOOK`/`SETCHAN` tail describes, resolving its
/// area (including a possible `GET key id` reference) once at creation
/// time — the hook tracks the fence's geometry as of registration, not the
/// referenced object's live position (an Open Question resolved this way
/// since nothing in the fence model re-evaluates a `GET` area on its own).
async fn resolve_fence(server: &Arc<Server>, fence_args: &FenceArgs) -> CommandResult<Fence> {
    let (kind, geometry) = match &fence_args.search.geometry_kind {
        SearchKind::Scan => {
            if fence_args.roam.is_some() {
                (FenceKind::Within, Geometry::Rect { min_lat: 0.0, min_lon: 0.0, max_lat: 0.0, max_lon: 0.0 })
            } else {
                return Err(CommandError::Syntax("fence requires NEARBY/WITHIN/INTERSECTS or ROAM".into()));
            }
        }
        SearchKind::Nearby { origin } => (FenceKind::Nearby, resolve_area(server, origin).await?),
        SearchKind::Within { area } => (FenceKind::Within, resolve_area(server, area).await?),
        SearchKind::Intersects { area, .. } => (FenceKind::Intersects, resolve_area(server, area).await?),
    };
    Ok(Fence {
        kind,
        geometry,
        roam: fence_args.roam.clone(),
        detect: fence_args.detect.clone(),
        commands: fence_args.commands.clone(),
        glob: fence_args.search.base.matches.clone(),
        wheres: fence_args.search.base.wheres.clone(),
        whereins: fence_args.search.base.whereins.clone(),
    })
}

async fn hook_from_args(server: &Arc<Server>, name: String, endpoints: Vec<String>, fence_args: FenceArgs) -> CommandResult<Hook> {
    let key = fence_args.search.base.key.clone();
    let fence = resolve_fence(server, &fence_args).await?;
    Ok(Hook {
        name,
        key,
        delivery: Delivery::Webhooks(endpoints),
        fence,
        meta: vec![],
        output: fence_args.search.base.output,
        nofields: fence_args.search.base.nofields,
        expires_at: 0,
        cursor: 0,
    })
}

/// Re-encode an object as the `SET` frame that would recreate it, used by
/// `AOFSHRINK` (spec §4.2.5).
fn set_frame(key: &str, obj: &Object) -> Vec<String> {
    let mut frame = vec!["SET".to_string(), key.to_string(), obj.id.clone()];
    for (name, value) in &obj.fields.0 {
        frame.push("FIELD".to_string());
        frame.push(name.clone());
        frame.push(value.to_string());
    }
    match &obj.value {
        Value::Geom(crate::geometry::Geometry::Point { lat, lon, .. }) => {
            frame.push("POINT".to_string());
            frame.push(lat.to_string());
            frame.push(lon.to_string());
        }
        Value::Geom(g) => {
            frame.push("OBJECT".to_string());
            frame.push(serde_json::to_string(g).unwrap_or_default());
        }
        Value::Str(s) => {
            frame.push("STRING".to_string());
            frame.push(s.clone());
        }
    }
    frame
}

async fn dispatch_fences(server: &Arc<Server>, key: &str, obj: &Object, prev_geom: Option<&Geometry>, is_fset: bool) {
    let store = server.store.read().await;
    let Some(collection) = store.get(key) else { return };
    let mut hooks = server.hooks.write().await;
    let events = geofence_engine::evaluate_move(&mut hooks, collection, key, obj, prev_geom, is_fset);
    drop(hooks);
    drop(store);
    deliver(server, events).await;
}

async fn deliver(server: &Arc<Server>, events: Vec<FenceEvent>) {
    let hooks = server.hooks.read().await;
    for event in events {
        let Some(hook) = hooks.get(&event.hook_name) else { continue };
        match &hook.delivery {
            Delivery::Channel(channel) => {
                server.pubsub.publish(channel, event.object.clone()).await;
            }
            Delivery::Webhooks(_) => {
                if let Err(e) = server.outbox.push(&event).await {
                    warn!(hook = %event.hook_name, error = %e, "failed to enqueue fence event");
                }
            }
        }
    }
}

async fn execute_read(server: &Arc<Server>, cmd: &Command) -> CommandResult<Json> {
    match cmd {
        Command::Get { key, id, withfields, output } => {
            let store = server.store.read().await;
            let collection = store.get(key).ok_or(CommandError::KeyNotFound)?;
            let obj = collection.get(id).ok_or(CommandError::IdNotFound)?;
            let mut row = scan_writer::shape(*output, !*withfields, obj, None).value;
            row["ok"] = json!(true);
            Ok(row)
        }
        Command::Ttl { key, id } => {
            let store = server.store.read().await;
            let collection = store.get(key).ok_or(CommandError::KeyNotFound)?;
            let obj = collection.get(id).ok_or(CommandError::IdNotFound)?;
            let ttl = if obj.has_expiration() {
                ((obj.expires_at - crate::collection::now_nanos()).max(0) as f64) / 1_000_000_000.0
            } else {
                -1.0
            };
            Ok(json!({ "ttl": ttl }))
        }
        Command::Type { key } => {
            let store = server.store.read().await;
            store.get(key).ok_or(CommandError::KeyNotFound)?;
            Ok(json!({ "type": "hash" }))
        }
        Command::Bounds { key } => {
            let store = server.store.read().await;
            let collection = store.get(key).ok_or(CommandError::KeyNotFound)?;
            let rect = collection.bounds();
            Ok(json!({
                "bounds": { "sw": {"lat": rect.min_lat, "lon": rect.min_lon}, "ne": {"lat": rect.max_lat, "lon": rect.max_lon} }
            }))
        }
        Command::Keys { pattern } => {
            let store = server.store.read().await;
            let re = command::glob_to_regex(pattern);
            let keys: Vec<&String> = store.0.keys().filter(|k| re.is_match(k)).collect();
            Ok(json!({ "keys": keys }))
        }
        Command::Hooks { pattern } => {
            let hooks = server.hooks.read().await;
            Ok(json!({ "hooks": hooks.matching(pattern) }))
        }
        Command::Scan(search) => execute_scan(server, search).await,
        Command::Jget { key, id, path, raw } => {
            let store = server.store.read().await;
            let collection = store.get(key).ok_or(CommandError::KeyNotFound)?;
            let obj = collection.get(id).ok_or(CommandError::IdNotFound)?;
            let doc: Json = obj.value.as_str().and_then(|s| serde_json::from_str(s).ok()).unwrap_or(Json::Null);
            let value = crate::jsonpath::get(&doc, path).ok_or(CommandError::PathNotFound)?;
            if *raw && let Some(s) = value.as_str() {
                Ok(json!({ "ok": true, "value": s }))
            } else {
                Ok(json!({ "ok": true, "value": value }))
            }
        }
        _ => unreachable!("non-read command routed to execute_read"),
    }
}

async fn execute_scan(server: &Arc<Server>, search: &SearchArgs) -> CommandResult<Json> {
    // Resolve any `GET`-area reference up front, via its own short-lived
    // read guard, before taking the read guard the scan itself runs under.
    let resolved = match &search.geometry_kind {
        SearchKind::Scan => None,
        SearchKind::Nearby { origin } => Some(resolve_area(server, origin).await?),
        SearchKind::Within { area } => Some(resolve_area(server, area).await?),
        SearchKind::Intersects { area, .. } => Some(resolve_area(server, area).await?),
    };

    let store = server.store.read().await;
    let Some(collection) = store.get(&search.base.key) else {
        return Err(CommandError::KeyNotFound);
    };
    let args: &ScanArgs = &search.base;
    let rows = match &search.geometry_kind {
        SearchKind::Scan => scan_writer::collect(args, |emit| {
            collection.scan(args.reverse, args.cursor, crate::collection::Deadline::NONE, |obj| emit(obj, None))
        })?,
        SearchKind::Nearby { .. } => {
            let origin = resolved.as_ref().expect("resolved above");
            scan_writer::collect(args, |emit| {
                collection.nearby(origin, crate::collection::Deadline::NONE, |obj, dist| emit(obj, Some(dist)))
            })?
        }
        SearchKind::Within { .. } => {
            let area = resolved.as_ref().expect("resolved above");
            scan_writer::collect(args, |emit| collection.within(area, 0, crate::collection::Deadline::NONE, |obj| emit(obj, None)))?
        }
        SearchKind::Intersects { .. } => {
            let area = resolved.as_ref().expect("resolved above");
            scan_writer::collect(args, |emit| collection.intersects(area, 0, crate::collection::Deadline::NONE, |obj| emit(obj, None)))?
        }
    };
    if matches!(args.output, OutputMode::Count) {
        return Ok(json!({ "count": rows.len() }));
    }
    let objects: Vec<Json> = rows.into_iter().map(|r| r.value).collect();
    Ok(json!({ "objects": objects, "count": objects.len() }))
}

async fn execute_system(server: &Arc<Server>, session: &mut Session, cmd: Command) -> CommandResult<Json> {
    match cmd {
        Command::Ping => Ok(json!({ "ok": true, "pong": true })),
        Command::Quit => Ok(json!({ "ok": true })),
        Command::Output(format) => {
            session.output = format;
            Ok(json!({ "ok": true }))
        }
        Command::Auth { password } => {
            if server.authenticated_password.as_deref() == Some(password.as_str()) {
                session.authenticated = true;
                Ok(json!({ "ok": true }))
            } else {
                Err(CommandError::InvalidPassword)
            }
        }
        Command::ReadOnly(on) => {
            server.read_only.store(on, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
        Command::Aof { pos } => {
            // Kept for non-streaming callers (tests, the AOFSHRINK CLI
            // tool); the wire listener intercepts `AOF` before it reaches
            // the dispatcher to serve the live-tailing form instead (spec
            // §4.2.5).
            match server.aol.read_from(pos).await {
                Ok(b) => Ok(json!({ "ok": true, "bytes": hex::encode(b) })),
                Err(_) => Err(CommandError::Syntax("invalid AOF position".into())),
            }
        }
        Command::AofMd5 { pos, size } => {
            let (boundary, digest) = server
                .aol
                .checksum_at(pos + size)
                .await
                .map_err(|_| CommandError::Syntax("invalid AOFMD5 range".into()))?;
            Ok(json!({ "md5": digest, "pos": boundary }))
        }
        Command::Stats { keys } => {
            let store = server.store.read().await;
            let mut out = Vec::new();
            for key in keys {
                out.push(match store.get(&key) {
                    Some(c) => json!({ "key": key, "num_objects": c.count() }),
                    None => json!({ "key": key, "num_objects": 0 }),
                });
            }
            Ok(json!({ "stats": out }))
        }
        Command::Config { action } => {
            let mut config = server.config.write().await;
            match action {
                ConfigAction::Get(key) => {
                    let mut obj = serde_json::Map::new();
                    obj.insert(key.clone(), json!(config.get(&key)));
                    Ok(Json::Object(obj))
                }
                ConfigAction::Set(key, value) => {
                    if config.set(&key, &value) {
                        Ok(json!({ "ok": true }))
                    } else {
                        Err(CommandError::Syntax(format!("unknown config key {key}")))
                    }
                }
                ConfigAction::Rewrite => config
                    .rewrite()
                    .map(|_| json!({ "ok": true }))
                    .map_err(|_| CommandError::Syntax("config rewrite failed".into())),
            }
        }
        Command::Follow { .. } => Err(CommandError::Syntax("FOLLOW is leaderless in this build".into())),
        Command::Publish { channel, message } => {
            let delivered = server.pubsub.publish(&channel, json!(message)).await;
            Ok(json!({ "ok": true, "receivers": delivered }))
        }
        // Actual message delivery for SUBSCRIBE/PSUBSCRIBE is a streaming
        // concern handled by the wire layer calling `pubsub.subscribe`
        // directly; this just acknowledges the command.
        Command::Subscribe { channels } => Ok(json!({ "ok": true, "channels": channels })),
        Command::Psubscribe { patterns } => Ok(json!({ "ok": true, "patterns": patterns })),
        Command::Client { .. } => Ok(json!({ "ok": true })),
        Command::Replconf => Ok(json!({ "ok": true })),
        Command::Info => Ok(json!({
            "ok": true,
            "info": {
                "version": env!("CARGO_PKG_VERSION"),
                "role": if server.is_read_only() { "follower" } else { "leader" },
            }
        })),
        Command::Server => Ok(json!({
            "ok": true,
            "stats": {
                "connections_accepted": server.counters.connections_accepted.load(Ordering::Relaxed),
                "commands_processed": server.counters.commands_processed.load(Ordering::Relaxed),
            }
        })),
        Command::Chans { pattern } => Ok(json!({ "ok": true, "chans": server.pubsub.matching(&pattern).await })),
        _ => unreachable!("non-system command routed to execute_system"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn test_server() -> Arc<Server> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("config.json")).unwrap();
        let server = Server::open(config).await.unwrap();
        std::mem::forget(dir);
        server
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let server = test_server().await;
        let mut session = Session::default();
        execute(&server, &mut session, vec!["SET".into(), "fleet".into(), "t1".into(), "POINT".into(), "33.5".into(), "-112.1".into()])
            .await
            .unwrap();
        let resp = execute(&server, &mut session, vec!["GET".into(), "fleet".into(), "t1".into()])
            .await
            .unwrap();
        assert_eq!(resp["id"], "t1");
    }

    #[tokio::test]
    async fn del_missing_id_errors_with_erron404() {
        let server = test_server().await;
        let mut session = Session::default();
        let err = execute(&server, &mut session, vec!["DEL".into(), "fleet".into(), "nope".into(), "ERRON404".into()])
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::IdNotFound);

        let ok = execute(&server, &mut session, vec!["DEL".into(), "fleet".into(), "nope".into()])
            .await
            .unwrap();
        assert_eq!(ok["ok"], true);
    }

    #[tokio::test]
    async fn fset_dispatches_fence_transitions() {
        let server = test_server().await;
        let mut session = Session::default();
        execute(
            &server,
            &mut session,
            vec!["SETCHAN".into(), "warn".into(), "WITHIN".into(), "fleet".into(), "FENCE".into(), "BOUNDS".into(), "0".into(), "0".into(), "10".into(), "10".into()],
        )
        .await
        .unwrap();
        let mut rx = server.pubsub.subscribe("warn").await;
        execute(&server, &mut session, vec!["SET".into(), "fleet".into(), "t1".into(), "POINT".into(), "5".into(), "5".into()])
            .await
            .unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg["id"], "t1");

        execute(&server, &mut session, vec!["FSET".into(), "fleet".into(), "t1".into(), "speed".into(), "42".into()])
            .await
            .unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg["id"], "t1");
    }

    #[tokio::test]
    async fn jset_then_jget_roundtrips_nested_path() {
        let server = test_server().await;
        let mut session = Session::default();
        execute(&server, &mut session, vec!["JSET".into(), "fleet".into(), "t1".into(), "driver.name".into(), "\"Ana\"".into()])
            .await
            .unwrap();
        let resp = execute(&server, &mut session, vec!["JGET".into(), "fleet".into(), "t1".into(), "driver.name".into()])
            .await
            .unwrap();
        assert_eq!(resp["value"], "Ana");
    }

    #[tokio::test]
    async fn replay_aborts_on_non_tolerable_error() {
        let server = test_server().await;
        let frames = vec![vec!["RENAMENX".into(), "missing".into(), "other".into()]];
        let err = replay(&server, frames).await.unwrap_err();
        assert!(err.to_string().contains("key not found"));
    }
}
