// ─── Paso 3: Módulo State — Máquina de estados de conexión ───
//
// Núcleo PURO del gestor: no toca el radio, no toca timers, no toca
// la red. Recibe eventos etiquetados (`Event`) y devuelve efectos
// (`Effect`) que un ejecutor con acceso al hardware lleva a cabo.
// Esa separación es lo que permite testear toda la política de
// conexión (cola de candidatos, reconexión acotada, backoff) en el
// harness normal de cargo.
//
// Todo el estado mutable vive aquí y solo el worker del firmware
// llama a apply() — una sola unidad de concurrencia, cero locks.

use std::net::Ipv4Addr;
use std::time::Duration;

use embedded_svc::wifi::AuthMethod;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::portal::PortalSession;

// ─── Política de reconexión ───

/// Intentos de conexión permitidos contra el mismo candidato antes de
/// pasar al siguiente de la cola (o a un rescan si la cola está vacía).
pub const MAX_RECONNECT_COUNT: u32 = 5;

/// Intervalo inicial entre scans sin candidato utilizable.
pub const DEFAULT_SCAN_MIN_INTERVAL: Duration = Duration::from_secs(10);
/// Tope del backoff exponencial entre scans.
pub const DEFAULT_SCAN_MAX_INTERVAL: Duration = Duration::from_secs(120);

// ─── Redes conocidas ───

/// Una red configurada por el usuario. Inmutable para el core: el
/// gestor de conexión la lee pero nunca la modifica. El username es
/// opcional y tiene doble uso: WPA2-Enterprise si el AP lo anuncia, o
/// login de portal cautivo si el AP es abierto/WPA2.
#[derive(Debug, Default, Clone, Zeroize, ZeroizeOnDrop)]
pub struct KnownCredential {
    pub ssid: String,
    pub password: String,
    pub username: Option<String>,
}

// ─── Resultados de scan y candidatos ───

/// Un AP visto en el último scan, ya traducido del driver a tipos
/// propios (el core no conoce `AccessPointInfo`).
#[derive(Debug, Clone)]
pub struct ScanHit {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub channel: u8,
    pub auth_method: AuthMethod,
    pub rssi: i8,
}

/// Un ScanHit casado con una credencial guardada. Se crea fresco en
/// cada ciclo de scan y se descarta al consumirse — nunca se persiste.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct CandidateRecord {
    pub ssid: String,
    pub password: String,
    pub username: Option<String>,
    #[zeroize(skip)]
    pub bssid: [u8; 6],
    #[zeroize(skip)]
    pub channel: u8,
    #[zeroize(skip)]
    pub auth_method: AuthMethod,
    #[zeroize(skip)]
    pub rssi: i8,
}

impl CandidateRecord {
    /// Username + auth mode enterprise = credencial EAP de verdad.
    pub fn is_enterprise(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.auth_method == AuthMethod::WPA2Enterprise
    }

    /// Username pero auth mode NO enterprise: la heurística que
    /// distingue credenciales WPA2-Enterprise de un usuario/contraseña
    /// de portal cautivo anunciados en el mismo registro.
    pub fn is_portal_eligible(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty()) && !self.is_enterprise()
    }
}

// ─── Backoff exponencial entre scans ───

/// Invariante: `min <= current <= max`. Se resetea a `min` con cada IP
/// adquirida; se duplica (con tope) con cada scan sin candidato.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl BackoffState {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, min, max }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn advance(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

// ─── Eventos y efectos ───

/// Lo que el mundo le cuenta al core. Las suscripciones al event loop
/// y el timer solo traducen y reenvían; nunca mutan estado.
#[derive(Debug)]
pub enum Event {
    /// El radio arrancó en modo station.
    Started,
    /// Scan completado, con los APs vistos.
    ScanCompleted(Vec<ScanHit>),
    /// El comando de scan falló en el acto: no habrá ScanCompleted.
    ScanFailed,
    /// El AP nos soltó (o falló el intento de conexión en el aire).
    Disconnected,
    /// El comando de conexión falló en el acto (p.ej. credencial
    /// malformada): no habrá Disconnected para este intento.
    ConnectFailed,
    /// DHCP nos asignó IP — la conexión está realmente arriba.
    IpAcquired { ip: Ipv4Addr, gateway: Ipv4Addr },
    /// Tick del timer de rescan.
    RescanTick,
    /// Cambio en caliente del rango de backoff entre scans.
    ScanIntervalsChanged { min: Duration, max: Duration },
}

/// Lo que el core le pide al ejecutor. Cada efecto es una orden
/// concreta; el core no sabe cómo se ejecuta ninguna.
#[derive(Debug)]
pub enum Effect {
    /// Arrancar un scan de APs.
    StartScan,
    /// Configurar el radio para `CandidateRecord` y conectar.
    Connect(CandidateRecord),
    /// Reintentar la conexión al candidato actual (sin reconfigurar).
    Reconnect,
    /// Armar el timer de rescan a un disparo.
    ArmRescan(Duration),
    /// Publicar el flag de conectado hacia wait_for_connected().
    SetConnected(bool),
    /// Lanzar la tarea de login de portal cautivo.
    SpawnPortal(PortalSession),
    // Callbacks de ciclo de vida hacia la UI (observadores puros)
    NotifyScanBegin,
    NotifyConnecting(String),
    NotifyConnected(String),
    NotifyDisconnected,
}

// ─── Callbacks de ciclo de vida ───

pub type UnitCallback = Box<dyn Fn() + Send>;
pub type SsidCallback = Box<dyn Fn(&str) + Send>;

/// Como mucho un handler por evento. Se invocan síncronamente desde el
/// ejecutor: deben ser rápidos y no bloquear. El registro se comparte
/// (Arc<Mutex>) entre la estación y su worker, así que registrar un
/// handler vale antes y después de arrancar, y sobrevive a un
/// stop()/start().
#[derive(Default)]
pub struct StationCallbacks {
    pub on_scan_begin: Option<UnitCallback>,
    pub on_connect: Option<SsidCallback>,
    pub on_connected: Option<SsidCallback>,
    pub on_disconnected: Option<UnitCallback>,
}

impl StationCallbacks {
    /// Despacha un efecto Notify* al handler registrado, si lo hay.
    /// Los demás efectos no son asunto de los callbacks.
    pub fn notify(&self, effect: &Effect) {
        match effect {
            Effect::NotifyScanBegin => {
                if let Some(cb) = &self.on_scan_begin {
                    cb();
                }
            }
            Effect::NotifyConnecting(ssid) => {
                if let Some(cb) = &self.on_connect {
                    cb(ssid);
                }
            }
            Effect::NotifyConnected(ssid) => {
                if let Some(cb) = &self.on_connected {
                    cb(ssid);
                }
            }
            Effect::NotifyDisconnected => {
                if let Some(cb) = &self.on_disconnected {
                    cb();
                }
            }
            _ => {}
        }
    }
}

// ─── El core ───

pub struct StationCore {
    known: Vec<KnownCredential>,
    queue: Vec<CandidateRecord>,
    backoff: BackoffState,
    reconnect_count: u32,
    current: Option<CandidateRecord>,
    connected: bool,
    was_connected: bool,
}

impl StationCore {
    pub fn new(known: Vec<KnownCredential>, scan_min: Duration, scan_max: Duration) -> Self {
        Self {
            known,
            queue: Vec::new(),
            backoff: BackoffState::new(scan_min, scan_max),
            reconnect_count: 0,
            current: None,
            connected: false,
            was_connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// La transición: un evento entra, efectos salen. Sin tocar nada
    /// fuera del propio core.
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Started => vec![Effect::NotifyScanBegin, Effect::StartScan],
            Event::RescanTick => {
                if self.connected {
                    vec![]
                } else {
                    vec![Effect::StartScan]
                }
            }
            Event::ScanCompleted(hits) => self.handle_scan(hits),
            Event::ScanFailed => self.handle_scan_failed(),
            Event::Disconnected => self.handle_disconnect(),
            Event::ConnectFailed => self.handle_connect_failed(),
            Event::IpAcquired { gateway, .. } => self.handle_ip_acquired(gateway),
            Event::ScanIntervalsChanged { min, max } => {
                // Rango nuevo y vuelta al mínimo: el cambio surte
                // efecto en el siguiente rescan, no en el próximo start
                self.backoff = BackoffState::new(min, max);
                vec![]
            }
        }
    }

    // ─── Scan: construir la cola de candidatos ───

    fn handle_scan(&mut self, mut hits: Vec<ScanHit>) -> Vec<Effect> {
        // Un scan tardío con la conexión ya levantada no debe tumbarla
        if self.connected {
            return vec![];
        }

        // Más fuerte primero. Duplicados de SSID (mismo nombre, varios
        // APs) se conservan como candidatos separados: la cola, no una
        // deduplicación, decide la prioridad.
        hits.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        self.queue.clear();
        for hit in hits {
            if let Some(cred) = self.known.iter().find(|c| c.ssid == hit.ssid) {
                self.queue.push(CandidateRecord {
                    ssid: cred.ssid.clone(),
                    password: cred.password.clone(),
                    username: cred.username.clone(),
                    bssid: hit.bssid,
                    channel: hit.channel,
                    auth_method: hit.auth_method,
                    rssi: hit.rssi,
                });
            }
        }

        if self.queue.is_empty() {
            return self.schedule_rescan();
        }
        self.connect_next()
    }

    /// El comando de scan ni siquiera arrancó. Sin ScanCompleted en
    /// camino, el timer de rescan es lo único que garantiza otro
    /// intento: armarlo con el backoff actual.
    fn handle_scan_failed(&mut self) -> Vec<Effect> {
        if self.connected {
            return vec![];
        }
        self.schedule_rescan()
    }

    /// Saca la cabeza de la cola y la convierte en el candidato activo.
    /// Un intento nuevo siempre resetea el contador de reconexión.
    fn connect_next(&mut self) -> Vec<Effect> {
        let candidate = self.queue.remove(0);
        self.reconnect_count = 0;
        self.current = Some(candidate.clone());
        vec![
            Effect::NotifyConnecting(candidate.ssid.clone()),
            Effect::Connect(candidate),
        ]
    }

    /// Programa el rescan con el intervalo actual y LUEGO duplica el
    /// intervalo — así la espera crece solo tras ciclos fallidos.
    fn schedule_rescan(&mut self) -> Vec<Effect> {
        let delay = self.backoff.current();
        self.backoff.advance();
        vec![Effect::ArmRescan(delay)]
    }

    // ─── Desconexión: política de reintento acotada ───

    fn handle_disconnect(&mut self) -> Vec<Effect> {
        self.connected = false;
        let mut effects = vec![Effect::SetConnected(false)];

        // El callback solo se dispara al CAER una conexión que llegó a
        // estar arriba; los fallos durante el intento inicial no
        // generan ruido en la UI.
        if self.was_connected {
            self.was_connected = false;
            effects.push(Effect::NotifyDisconnected);
        }

        self.reconnect_count += 1;
        if self.reconnect_count < MAX_RECONNECT_COUNT {
            // Caída transitoria: reintentar el mismo candidato
            effects.push(Effect::Reconnect);
        } else if !self.queue.is_empty() {
            // Techo alcanzado: siguiente candidato de la cola
            effects.extend(self.connect_next());
        } else {
            // Cola agotada: backoff y rescan
            effects.extend(self.schedule_rescan());
        }
        effects
    }

    /// El comando de conexión falló sin llegar al aire: el candidato no
    /// sirve (credencial malformada, config rechazada). Se descarta sin
    /// gastar reintentos en él y se sigue con la cola o con un rescan.
    fn handle_connect_failed(&mut self) -> Vec<Effect> {
        self.current = None;
        self.reconnect_count = 0;
        if !self.queue.is_empty() {
            self.connect_next()
        } else {
            self.schedule_rescan()
        }
    }

    // ─── IP adquirida: conexión confirmada ───

    fn handle_ip_acquired(&mut self, gateway: Ipv4Addr) -> Vec<Effect> {
        self.connected = true;
        self.was_connected = true;
        self.reconnect_count = 0;
        self.backoff.reset();
        // Los candidatos restantes eran de un scan ya obsoleto
        self.queue.clear();

        let mut effects = vec![Effect::SetConnected(true)];
        if let Some(current) = &self.current {
            effects.push(Effect::NotifyConnected(current.ssid.clone()));

            if current.is_portal_eligible() {
                // Copia por valor: la sesión es un snapshot y la tarea
                // de portal no comparte estado con esta máquina.
                effects.push(Effect::SpawnPortal(PortalSession {
                    username: current.username.clone().unwrap_or_default(),
                    password: current.password.clone(),
                    ssid: current.ssid.clone(),
                    gateway,
                }));
            }
        }
        effects
    }
}

// ─── Tests ───

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn known(ssid: &str, pass: &str, user: Option<&str>) -> KnownCredential {
        KnownCredential {
            ssid: ssid.to_string(),
            password: pass.to_string(),
            username: user.map(str::to_string),
        }
    }

    fn hit(ssid: &str, rssi: i8, auth: AuthMethod) -> ScanHit {
        ScanHit {
            ssid: ssid.to_string(),
            bssid: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            channel: 6,
            auth_method: auth,
            rssi,
        }
    }

    fn core_with(known_list: Vec<KnownCredential>) -> StationCore {
        StationCore::new(
            known_list,
            DEFAULT_SCAN_MIN_INTERVAL,
            DEFAULT_SCAN_MAX_INTERVAL,
        )
    }

    fn connecting_ssid(effects: &[Effect]) -> Option<&str> {
        effects.iter().find_map(|e| match e {
            Effect::Connect(c) => Some(c.ssid.as_str()),
            _ => None,
        })
    }

    #[test]
    fn queue_contains_only_known_ssids_sorted_by_rssi() {
        let mut core = core_with(vec![known("HomeNet", "a", None), known("Cafe-Guest", "b", None)]);
        let effects = core.apply(Event::ScanCompleted(vec![
            hit("HomeNet", -70, AuthMethod::WPA2Personal),
            hit("Stranger", -40, AuthMethod::WPA2Personal),
            hit("Cafe-Guest", -50, AuthMethod::WPA2Personal),
        ]));

        // El AP desconocido más fuerte no entra; de los conocidos gana
        // el de mejor señal.
        assert_eq!(connecting_ssid(&effects), Some("Cafe-Guest"));
        // La cabeza se consumió; en la cola queda solo HomeNet
        assert_eq!(core.queue_len(), 1);
    }

    #[test]
    fn duplicate_ssids_are_kept_as_separate_candidates() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);
        core.apply(Event::ScanCompleted(vec![
            hit("HomeNet", -60, AuthMethod::WPA2Personal),
            hit("HomeNet", -80, AuthMethod::WPA2Personal),
        ]));
        // Uno consumido como candidato activo, el otro sigue en cola
        assert_eq!(core.queue_len(), 1);
    }

    #[test]
    fn empty_scan_schedules_rescan_with_doubling_backoff() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);

        let mut last = Duration::ZERO;
        for _ in 0..6 {
            let effects = core.apply(Event::ScanCompleted(vec![]));
            let delay = match &effects[..] {
                [Effect::ArmRescan(d)] => *d,
                other => panic!("expected ArmRescan, got {other:?}"),
            };
            // Monótono no decreciente y nunca por encima del tope
            assert!(delay >= last);
            assert!(delay <= DEFAULT_SCAN_MAX_INTERVAL);
            last = delay;
        }
        assert_eq!(last, DEFAULT_SCAN_MAX_INTERVAL);
    }

    #[test]
    fn scan_command_failure_schedules_backed_off_rescan() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);

        // Primer fallo: rescan armado con el intervalo mínimo. Nada
        // queda "en el aire": el timer es el reintento.
        let effects = core.apply(Event::ScanFailed);
        assert!(
            matches!(&effects[..], [Effect::ArmRescan(d)] if *d == DEFAULT_SCAN_MIN_INTERVAL)
        );

        // Fallos seguidos avanzan el backoff igual que scans vacíos
        let effects = core.apply(Event::ScanFailed);
        assert!(
            matches!(&effects[..], [Effect::ArmRescan(d)] if *d == DEFAULT_SCAN_MIN_INTERVAL * 2)
        );
    }

    #[test]
    fn connect_command_failure_advances_to_next_candidate() {
        let mut core = core_with(vec![known("HomeNet", "a", None), known("Cafe-Guest", "b", None)]);
        core.apply(Event::ScanCompleted(vec![
            hit("HomeNet", -50, AuthMethod::WPA2Personal),
            hit("Cafe-Guest", -60, AuthMethod::WPA2Personal),
        ]));

        // El comando para HomeNet falló en seco (sin evento del radio):
        // el candidato se descarta y la cola avanza de inmediato
        let effects = core.apply(Event::ConnectFailed);
        assert_eq!(connecting_ssid(&effects), Some("Cafe-Guest"));
        assert_eq!(core.reconnect_count(), 0);
        assert_eq!(core.queue_len(), 0);
    }

    #[test]
    fn connect_command_failure_with_empty_queue_schedules_rescan() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);
        core.apply(Event::ScanCompleted(vec![hit(
            "HomeNet",
            -60,
            AuthMethod::WPA2Personal,
        )]));

        let effects = core.apply(Event::ConnectFailed);
        assert!(matches!(&effects[..], [Effect::ArmRescan(_)]));
    }

    #[test]
    fn disconnects_retry_same_candidate_until_ceiling_then_rescan() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);
        core.apply(Event::ScanCompleted(vec![hit(
            "HomeNet",
            -60,
            AuthMethod::WPA2Personal,
        )]));
        assert_eq!(core.queue_len(), 0);

        // Las primeras 4 caídas reintentan el mismo candidato
        for expected in 1..MAX_RECONNECT_COUNT {
            let effects = core.apply(Event::Disconnected);
            assert!(matches!(effects.last(), Some(Effect::Reconnect)));
            assert_eq!(core.reconnect_count(), expected);
        }

        // La 5ª, con la cola vacía, programa un rescan — no un 6º intento
        let effects = core.apply(Event::Disconnected);
        assert!(matches!(effects.last(), Some(Effect::ArmRescan(_))));
        assert_eq!(core.reconnect_count(), MAX_RECONNECT_COUNT);
    }

    #[test]
    fn ceiling_with_queued_candidate_advances_queue() {
        let mut core = core_with(vec![known("HomeNet", "a", None), known("Cafe-Guest", "b", None)]);
        core.apply(Event::ScanCompleted(vec![
            hit("HomeNet", -50, AuthMethod::WPA2Personal),
            hit("Cafe-Guest", -60, AuthMethod::WPA2Personal),
        ]));

        for _ in 1..MAX_RECONNECT_COUNT {
            core.apply(Event::Disconnected);
        }
        let effects = core.apply(Event::Disconnected);
        // Al techo: pasa al siguiente candidato y el contador vuelve a 0
        assert_eq!(connecting_ssid(&effects), Some("Cafe-Guest"));
        assert_eq!(core.reconnect_count(), 0);
    }

    #[test]
    fn ip_acquired_resets_counter_backoff_and_queue() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);

        // Ensuciar todo el estado primero
        core.apply(Event::ScanCompleted(vec![]));
        core.apply(Event::ScanCompleted(vec![
            hit("HomeNet", -50, AuthMethod::WPA2Personal),
            hit("HomeNet", -80, AuthMethod::WPA2Personal),
        ]));
        core.apply(Event::Disconnected);
        core.apply(Event::Disconnected);

        core.apply(Event::IpAcquired {
            ip: "192.168.1.50".parse().unwrap(),
            gateway: "192.168.1.1".parse().unwrap(),
        });

        assert!(core.is_connected());
        assert_eq!(core.reconnect_count(), 0);
        assert_eq!(core.backoff().current(), core.backoff().min());
        assert_eq!(core.queue_len(), 0);
    }

    #[test]
    fn interval_range_change_takes_effect_immediately() {
        let mut core = core_with(vec![]);

        // Inflar el backoff primero
        core.apply(Event::ScanCompleted(vec![]));
        core.apply(Event::ScanCompleted(vec![]));

        core.apply(Event::ScanIntervalsChanged {
            min: Duration::from_secs(5),
            max: Duration::from_secs(20),
        });

        // El siguiente ciclo fallido ya usa el rango nuevo, desde su
        // mínimo — sin esperar a un restart
        let effects = core.apply(Event::ScanCompleted(vec![]));
        assert!(matches!(&effects[..], [Effect::ArmRescan(d)] if *d == Duration::from_secs(5)));
    }

    #[test]
    fn disconnected_callback_fires_once_and_only_after_connected() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);
        core.apply(Event::ScanCompleted(vec![hit(
            "HomeNet",
            -60,
            AuthMethod::WPA2Personal,
        )]));

        // Caída durante el intento inicial: sin callback
        let effects = core.apply(Event::Disconnected);
        assert!(!effects.iter().any(|e| matches!(e, Effect::NotifyDisconnected)));

        core.apply(Event::IpAcquired {
            ip: "10.0.0.2".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
        });

        // Primera caída tras estar conectados: exactamente un callback
        let effects = core.apply(Event::Disconnected);
        let fired = effects
            .iter()
            .filter(|e| matches!(e, Effect::NotifyDisconnected))
            .count();
        assert_eq!(fired, 1);

        // Segunda caída consecutiva: ya no
        let effects = core.apply(Event::Disconnected);
        assert!(!effects.iter().any(|e| matches!(e, Effect::NotifyDisconnected)));
    }

    #[test]
    fn username_with_non_enterprise_auth_is_portal_eligible() {
        let record = CandidateRecord {
            ssid: "Cafe-Guest".to_string(),
            password: "pw".to_string(),
            username: Some("alice".to_string()),
            bssid: [0; 6],
            channel: 1,
            auth_method: AuthMethod::None,
            rssi: -50,
        };
        assert!(record.is_portal_eligible());
        assert!(!record.is_enterprise());
    }

    #[test]
    fn username_with_enterprise_auth_is_never_portal_eligible() {
        let record = CandidateRecord {
            ssid: "Corp".to_string(),
            password: "pw".to_string(),
            username: Some("alice".to_string()),
            bssid: [0; 6],
            channel: 1,
            auth_method: AuthMethod::WPA2Enterprise,
            rssi: -50,
        };
        assert!(record.is_enterprise());
        assert!(!record.is_portal_eligible());
    }

    #[test]
    fn portal_session_is_spawned_with_snapshot_of_candidate() {
        let mut core = core_with(vec![known("Cafe-Guest", "pw", Some("alice"))]);
        core.apply(Event::ScanCompleted(vec![hit(
            "Cafe-Guest",
            -55,
            AuthMethod::None,
        )]));

        let effects = core.apply(Event::IpAcquired {
            ip: "10.0.0.2".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
        });

        let session = effects
            .iter()
            .find_map(|e| match e {
                Effect::SpawnPortal(s) => Some(s),
                _ => None,
            })
            .expect("portal session expected");
        assert_eq!(session.username, "alice");
        assert_eq!(session.password, "pw");
        assert_eq!(session.ssid, "Cafe-Guest");
        assert_eq!(session.gateway, "10.0.0.1".parse::<Ipv4Addr>().unwrap());

        // Una desconexión posterior no retira ni repite la sesión:
        // la tarea en vuelo es dueña de su copia y corre hasta el final
        let effects = core.apply(Event::Disconnected);
        assert!(!effects.iter().any(|e| matches!(e, Effect::SpawnPortal(_))));
    }

    #[test]
    fn enterprise_candidate_never_spawns_portal_session() {
        let mut core = core_with(vec![known("Corp", "pw", Some("alice"))]);
        core.apply(Event::ScanCompleted(vec![hit(
            "Corp",
            -55,
            AuthMethod::WPA2Enterprise,
        )]));
        let effects = core.apply(Event::IpAcquired {
            ip: "10.0.0.2".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
        });
        assert!(!effects.iter().any(|e| matches!(e, Effect::SpawnPortal(_))));
    }

    #[test]
    fn rescan_tick_is_ignored_while_connected() {
        let mut core = core_with(vec![known("HomeNet", "a", None)]);
        core.apply(Event::ScanCompleted(vec![hit(
            "HomeNet",
            -60,
            AuthMethod::WPA2Personal,
        )]));
        core.apply(Event::IpAcquired {
            ip: "10.0.0.2".parse().unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
        });

        assert!(core.apply(Event::RescanTick).is_empty());
        // Un fallo de comando de scan rezagado tampoco arma nada
        assert!(core.apply(Event::ScanFailed).is_empty());
        // Y un resultado de scan rezagado tampoco toca la conexión
        assert!(core
            .apply(Event::ScanCompleted(vec![hit(
                "HomeNet",
                -40,
                AuthMethod::WPA2Personal
            )]))
            .is_empty());
    }

    #[test]
    fn started_event_begins_scanning_and_notifies() {
        let mut core = core_with(vec![]);
        let effects = core.apply(Event::Started);
        assert!(matches!(effects[0], Effect::NotifyScanBegin));
        assert!(matches!(effects[1], Effect::StartScan));
    }

    #[test]
    fn callback_registry_survives_executor_swaps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(Mutex::new(StationCallbacks::default()));

        {
            let calls = Arc::clone(&calls);
            registry.lock().unwrap().on_connected = Some(Box::new(move |_ssid| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let effect = Effect::NotifyConnected("HomeNet".to_string());

        // Primer "arranque": el ejecutor comparte el registro
        let worker = Arc::clone(&registry);
        worker.lock().unwrap().notify(&effect);
        drop(worker);

        // Parada y nuevo arranque: otro ejecutor, mismo registro. El
        // handler sigue ahí — nadie lo consumió.
        let worker = Arc::clone(&registry);
        worker.lock().unwrap().notify(&effect);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_callback_registration_takes_effect() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(Mutex::new(StationCallbacks::default()));
        let worker = Arc::clone(&registry);

        // Nada registrado aún: no pasa nada
        worker.lock().unwrap().notify(&Effect::NotifyDisconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Registro con el "worker" ya en marcha
        {
            let calls = Arc::clone(&calls);
            registry.lock().unwrap().on_disconnected = Some(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        worker.lock().unwrap().notify(&Effect::NotifyDisconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
