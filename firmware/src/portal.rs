// ─── Paso 3: Módulo Portal — Agente de detección y login ───
//
// Muchas redes "abiertas" interceptan todo el HTTP hasta que pasas por
// una página de login. Este agente ejecuta los probes reales, resuelve
// DNS y postea las credenciales; cada decisión (veredictos, URLs,
// reglas de fallback) la toma wifi-core::portal.
//
// La tarea corre suelta (fire-and-forget): su lentitud o su fallo
// jamás bloquean la lógica de reconexión de station.rs.

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::{Headers, Method, Status};
use embedded_svc::io::Write;
use esp_idf_svc::http::client::{
    Configuration as HttpConfiguration, EspHttpConnection, FollowRedirectsPolicy,
};
use log::{info, warn};
use zeroize::Zeroize;

use wifi_core::portal::{
    classify_probe, fallback_login_url, normalize_login_url, synthesize_login_url, FallbackRule,
    PortalSession, ProbeKind, ProbeVerdict, FALLBACK_RULES,
};

// ─── Constantes ───

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(8);
const PORTAL_TASK_STACK: usize = 8 * 1024;

// Los portales suelen ignorar (o bloquear) user-agents de dispositivos
// embebidos; nos presentamos como un navegador de escritorio.
const LOGIN_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

// ─── Probes ───

struct Probe {
    url: &'static str,
    host: &'static str,
    kind: ProbeKind,
}

/// Endpoint que devuelve 204 sin cuerpo en una red con internet abierto.
const NO_CONTENT_PROBE: Probe = Probe {
    url: "http://connect.rom.miui.com/generate_204",
    host: "connect.rom.miui.com",
    kind: ProbeKind::NoContent,
};

/// Segundo check, independiente del primero.
const CONNECTIVITY_PROBE: Probe = Probe {
    url: "http://captive.apple.com/",
    host: "captive.apple.com",
    kind: ProbeKind::ConnectivityCheck,
};

// ─── Lanzamiento de la tarea ───

/// Lanza la tarea de login y descarta el handle a propósito: corre
/// hasta terminar aunque la conexión que la originó ya se haya caído.
/// Una reconexión posterior creará una sesión fresca si hace falta.
pub fn spawn_login_task(session: PortalSession) {
    let spawned = thread::Builder::new()
        .name("portal_login".into())
        .stack_size(PORTAL_TASK_STACK)
        .spawn(move || run(session, FALLBACK_RULES));

    if let Err(e) = spawned {
        warn!("Failed to spawn portal login task: {e}");
    }
}

fn run(session: PortalSession, rules: &[FallbackRule]) {
    info!(
        "Portal agent started for '{}' on SSID '{}'",
        session.username, session.ssid
    );

    let Some(login_url) = detect_login_url(&session, rules) else {
        warn!("No login URL determined, skipping portal login");
        return;
    };

    let post_url = normalize_login_url(&login_url);
    info!("Attempting portal login POST to {post_url}");

    match submit_login(&post_url, &session.username, &session.password) {
        Ok(status) => info!("Portal login result: HTTP {status}"),
        Err(e) => warn!("Portal login request failed: {e:?}"),
    }
}

// ─── Detección ───

fn detect_login_url(session: &PortalSession, rules: &[FallbackRule]) -> Option<String> {
    let mut intercepted = false;

    for probe in [&NO_CONTENT_PROBE, &CONNECTIVITY_PROBE] {
        match run_probe(probe) {
            Ok(ProbeVerdict::LoginUrl(url)) => {
                info!("Redirect found: {url}");
                return Some(url);
            }
            Ok(ProbeVerdict::Intercepted) => {
                intercepted = true;
                if let Some(url) = dns_hijack_guess(probe.host) {
                    return Some(url);
                }
            }
            Ok(ProbeVerdict::Clean) => {}
            // Timeout o red sin salida: se prueba el siguiente endpoint
            Err(e) => warn!("Probe {} failed: {e:?}", probe.url),
        }
    }

    fallback_login_url(&session.ssid, session.gateway, intercepted, rules)
}

/// Un GET con redirects DESACTIVADOS: los 302 hay que inspeccionarlos,
/// no seguirlos.
fn run_probe(probe: &Probe) -> Result<ProbeVerdict> {
    let connection = EspHttpConnection::new(&HttpConfiguration {
        timeout: Some(PROBE_TIMEOUT),
        follow_redirects_policy: FollowRedirectsPolicy::FollowNone,
        ..Default::default()
    })?;
    let mut client = HttpClient::wrap(connection);

    let request = client
        .request(Method::Get, probe.url, &[])
        .map_err(|e| anyhow!("probe request: {e:?}"))?;
    let response = request.submit().map_err(|e| anyhow!("probe submit: {e:?}"))?;

    let status = response.status();
    let location = response.header("Location").map(str::to_string);
    let content_length = response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok());

    info!("Probe {} status: {status}", probe.url);
    Ok(classify_probe(probe.kind, status, location, content_length))
}

/// Secuestro DNS clásico: el portal responde las queries él mismo con
/// una dirección privada. Si es el caso, esa dirección ES el portal.
fn dns_hijack_guess(host: &str) -> Option<String> {
    let addrs = match (host, 80).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("DNS lookup for {host} failed: {e}");
            return None;
        }
    };

    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            let ip = *v4.ip();
            info!("{host} resolved to {ip}");
            if ip.is_private() {
                return Some(synthesize_login_url(ip));
            }
        }
    }
    None
}

// ─── Login ───

/// POST form-encoded con las credenciales de la sesión. Sin reintentos:
/// si falla, un ciclo de reconexión futuro creará una sesión nueva.
fn submit_login(url: &str, username: &str, password: &str) -> Result<u16> {
    let connection = EspHttpConnection::new(&HttpConfiguration {
        timeout: Some(LOGIN_TIMEOUT),
        ..Default::default()
    })?;
    let mut client = HttpClient::wrap(connection);

    let mut body = format!("user={username}&pass={password}");
    let content_length = body.len().to_string();
    let headers = [
        ("User-Agent", LOGIN_USER_AGENT),
        ("Content-Type", "application/x-www-form-urlencoded"),
        ("Content-Length", content_length.as_str()),
    ];

    let result = (|| -> Result<u16> {
        let mut request = client
            .post(url, &headers)
            .map_err(|e| anyhow!("login request: {e:?}"))?;
        request
            .write_all(body.as_bytes())
            .map_err(|e| anyhow!("login body: {e:?}"))?;
        let response = request.submit().map_err(|e| anyhow!("login submit: {e:?}"))?;
        Ok(response.status())
    })();

    // El cuerpo lleva la contraseña en claro: fuera de memoria
    body.zeroize();
    result
}
