// ─── Paso 3: Módulo Portal — Clasificación de portal cautivo ───
//
// La mitad PURA del agente de portal: el veredicto de cada probe de
// conectividad, las URLs sintetizadas y las reglas de fallback. Nada
// de aquí toca la red — el agente del firmware ejecuta los GET/POST
// reales y delega cada decisión en estas funciones, que así se
// testean en el harness normal de cargo.
//
// Cómo se detecta un portal (en orden):
//
//   1. GET a un endpoint que SIEMPRE responde 204 sin cuerpo. Un 200
//      ahí es intercepción segura; un 302 nos regala la URL de login.
//   2. GET al check de conectividad de Apple: 302 = URL de login;
//      un 200 con cuerpo grande (la página "Success" real es diminuta)
//      también es intercepción.
//   3. Si hubo intercepción sin redirect explícito: resolver el host
//      del probe por DNS. Si responde una IP privada, el propio portal
//      secuestró el DNS — sintetizamos la URL de login desde esa IP.
//   4. Tabla de reglas por SSID (despliegues conocidos) y, si no,
//      la IP del gateway por defecto.

use std::net::Ipv4Addr;

use log::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

// La página "Success" de Apple ronda los 70 bytes; cualquier cuerpo
// fuera de esta ventana en ese endpoint es un portal.
const CLEAN_BODY_MAX: u64 = 200;

// ─── Reglas de fallback por SSID ───

/// URL de login fija para redes donde las heurísticas genéricas no
/// llegan. Tabla enchufable — las dos entradas BUPT vienen del
/// despliegue original y no deben ampliarse sin confirmar la red.
pub struct FallbackRule {
    pub ssid: &'static str,
    pub login_url: &'static str,
}

pub const FALLBACK_RULES: &[FallbackRule] = &[
    FallbackRule { ssid: "BUPT-portal", login_url: "http://10.3.8.216/login" },
    FallbackRule { ssid: "BUPT-mobile", login_url: "http://10.3.8.216/login" },
];

// ─── Sesión de portal ───

/// Snapshot tomado en el handoff desde la máquina de estados: la tarea
/// de login es dueña de estos datos por valor y no comparte nada con
/// ella. Vive exactamente un intento de detección+login.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct PortalSession {
    pub username: String,
    pub password: String,
    pub ssid: String,
    #[zeroize(skip)]
    pub gateway: Ipv4Addr,
}

// ─── Veredictos de probe ───

/// Qué esperar del endpoint: 204 vacío, o un 200 con cuerpo diminuto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    NoContent,
    ConnectivityCheck,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Redirect capturado: esta es la URL de login.
    LoginUrl(String),
    /// Intercepción inferida, pero sin URL explícita.
    Intercepted,
    /// Respuesta compatible con internet abierto.
    Clean,
}

/// Clasificación pura de una respuesta de probe.
pub fn classify_probe(
    kind: ProbeKind,
    status: u16,
    location: Option<String>,
    content_length: Option<u64>,
) -> ProbeVerdict {
    match status {
        301 | 302 => match location {
            Some(url) if !url.is_empty() => ProbeVerdict::LoginUrl(url),
            // Un redirect sin Location en estos endpoints sigue siendo
            // intercepción, solo que sin URL que capturar
            _ => ProbeVerdict::Intercepted,
        },
        200 => match kind {
            // generate_204 jamás contesta 200 con internet abierto
            ProbeKind::NoContent => ProbeVerdict::Intercepted,
            ProbeKind::ConnectivityCheck => match content_length {
                Some(len) if len > 0 && len < CLEAN_BODY_MAX => ProbeVerdict::Clean,
                _ => ProbeVerdict::Intercepted,
            },
        },
        // 204, 4xx, 5xx... nada que un portal de login produzca
        _ => ProbeVerdict::Clean,
    }
}

// ─── URLs de login ───

pub fn synthesize_login_url(addr: Ipv4Addr) -> String {
    format!("http://{addr}/login")
}

/// Últimos recursos: regla fija por SSID, o el gateway por defecto si
/// al menos inferimos intercepción. Sin intercepción y sin regla no se
/// postea nada — nunca mandamos credenciales a una red sana.
pub fn fallback_login_url(
    ssid: &str,
    gateway: Ipv4Addr,
    intercepted: bool,
    rules: &[FallbackRule],
) -> Option<String> {
    if let Some(rule) = rules.iter().find(|r| r.ssid == ssid) {
        info!("Applying fallback login rule for '{ssid}'");
        return Some(rule.login_url.to_string());
    }
    if intercepted {
        info!("Interception detected without redirect, trying gateway {gateway}");
        return Some(synthesize_login_url(gateway));
    }
    None
}

/// La URL de login debe acabar en un segmento de login. Si el redirect
/// ya apuntaba a uno, se respeta tal cual.
pub fn normalize_login_url(url: &str) -> String {
    if url.contains("login") {
        url.to_string()
    } else if url.ends_with('/') {
        format!("{url}login")
    } else {
        format!("{url}/login")
    }
}

// ─── Tests ───

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_on_no_content_probe_yields_login_url() {
        let verdict = classify_probe(
            ProbeKind::NoContent,
            302,
            Some("http://10.0.0.1/auth".to_string()),
            None,
        );
        assert_eq!(verdict, ProbeVerdict::LoginUrl("http://10.0.0.1/auth".to_string()));
    }

    #[test]
    fn plain_200_on_no_content_probe_is_interception() {
        let verdict = classify_probe(ProbeKind::NoContent, 200, None, Some(4096));
        assert_eq!(verdict, ProbeVerdict::Intercepted);
    }

    #[test]
    fn no_content_204_is_clean() {
        let verdict = classify_probe(ProbeKind::NoContent, 204, None, Some(0));
        assert_eq!(verdict, ProbeVerdict::Clean);
    }

    #[test]
    fn small_success_body_on_connectivity_check_is_clean() {
        // La página "Success" real de Apple: ~70 bytes
        let verdict = classify_probe(ProbeKind::ConnectivityCheck, 200, None, Some(68));
        assert_eq!(verdict, ProbeVerdict::Clean);
    }

    #[test]
    fn large_body_on_connectivity_check_is_interception() {
        let verdict = classify_probe(ProbeKind::ConnectivityCheck, 200, None, Some(12000));
        assert_eq!(verdict, ProbeVerdict::Intercepted);

        // Sin Content-Length tampoco nos fiamos
        let verdict = classify_probe(ProbeKind::ConnectivityCheck, 200, None, None);
        assert_eq!(verdict, ProbeVerdict::Intercepted);
    }

    #[test]
    fn redirect_without_location_is_interception() {
        let verdict = classify_probe(ProbeKind::NoContent, 302, None, None);
        assert_eq!(verdict, ProbeVerdict::Intercepted);
    }

    #[test]
    fn login_url_normalization_appends_login_segment() {
        // Escenario canónico: 302 a /auth → POST a /auth/login
        assert_eq!(
            normalize_login_url("http://10.0.0.1/auth"),
            "http://10.0.0.1/auth/login"
        );
        assert_eq!(
            normalize_login_url("http://10.0.0.1/"),
            "http://10.0.0.1/login"
        );
        // Una URL que ya es de login no se toca
        assert_eq!(
            normalize_login_url("http://10.3.8.216/login"),
            "http://10.3.8.216/login"
        );
    }

    #[test]
    fn private_dns_answer_synthesizes_login_url() {
        let addr: Ipv4Addr = "192.168.1.1".parse().unwrap();
        assert!(addr.is_private());
        assert_eq!(synthesize_login_url(addr), "http://192.168.1.1/login");
    }

    #[test]
    fn fallback_rule_matches_exact_ssid() {
        let gateway: Ipv4Addr = "10.3.0.1".parse().unwrap();
        // Regla fija: aplica incluso sin intercepción inferida
        assert_eq!(
            fallback_login_url("BUPT-portal", gateway, false, FALLBACK_RULES),
            Some("http://10.3.8.216/login".to_string())
        );
    }

    #[test]
    fn fallback_uses_gateway_only_when_intercepted() {
        let gateway: Ipv4Addr = "192.168.4.1".parse().unwrap();
        assert_eq!(
            fallback_login_url("Cafe-Guest", gateway, true, FALLBACK_RULES),
            Some("http://192.168.4.1/login".to_string())
        );
        // Sin intercepción: no hay URL y no se postea nada
        assert_eq!(
            fallback_login_url("Cafe-Guest", gateway, false, FALLBACK_RULES),
            None
        );
    }

    #[test]
    fn session_snapshot_owns_its_fields() {
        let session = PortalSession {
            username: "alice".to_string(),
            password: "secret".to_string(),
            ssid: "Cafe-Guest".to_string(),
            gateway: "10.0.0.1".parse().unwrap(),
        };
        // La sesión es autocontenida: nada referencia a la máquina de
        // estados, así que una reconexión concurrente no la invalida
        let copy = session.clone();
        drop(session);
        assert_eq!(copy.username, "alice");
        assert_eq!(copy.gateway, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    }
}
