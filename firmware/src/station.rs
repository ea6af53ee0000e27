// ─── Paso 3: Módulo Station — Radio, eventos y ejecutor ───
//
// La mitad impura del gestor. Aquí vive todo lo que toca hardware:
// el driver EspWifi, las suscripciones al event loop del sistema, el
// timer de rescan y el ejecutor de efectos.
//
// Modelo de concurrencia (importante para no interbloquearse con el
// task de eventos del propio ESP-IDF):
//
//   event loop ──┐
//   esp_timer  ──┼── solo traducir + send por el canal ──► worker
//                │                                          │
//   (nunca mutan estado ni tocan el driver)                 ▼
//                                            core.apply() + ejecutar efectos
//
// El worker es el ÚNICO contexto que muta la máquina de estados y el
// único que manda comandos al radio durante la operación normal. El
// flag "connected" se publica aparte, con Mutex + Condvar, para que
// wait_for_connected() pueda bloquear sin pisar el camino de mutación.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::sys;
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};
use esp_idf_svc::wifi::config::{ScanConfig, ScanType};
use esp_idf_svc::wifi::{EspWifi, WifiEvent};
use log::{info, warn};

use crate::credentials::{KnownCredential, RadioSettings};
use crate::portal;
use wifi_core::state::{
    CandidateRecord, Effect, Event, ScanHit, StationCallbacks, StationCore,
    DEFAULT_SCAN_MAX_INTERVAL, DEFAULT_SCAN_MIN_INTERVAL, MAX_RECONNECT_COUNT,
};

const WORKER_STACK_SIZE: usize = 8 * 1024;

// Mismos tiempos de dwell por canal que usa el scan activo de fábrica
const SCAN_DWELL_MIN: Duration = Duration::from_millis(120);
const SCAN_DWELL_MAX: Duration = Duration::from_millis(150);

// ─── Ajustes de la estación ───

#[derive(Debug, Clone, Copy)]
pub struct StationSettings {
    pub max_tx_power: i8,
    pub remember_bssid: bool,
    pub scan_min_interval: Duration,
    pub scan_max_interval: Duration,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            max_tx_power: 0,
            remember_bssid: false,
            scan_min_interval: DEFAULT_SCAN_MIN_INTERVAL,
            scan_max_interval: DEFAULT_SCAN_MAX_INTERVAL,
        }
    }
}

impl StationSettings {
    /// Combina los overrides persistidos con los intervalos por defecto.
    pub fn from_radio(radio: RadioSettings) -> Self {
        Self {
            max_tx_power: radio.max_tx_power,
            remember_bssid: radio.remember_bssid,
            ..Self::default()
        }
    }
}

/// Nivel de ahorro de energía del radio, de más agresivo a más rápido.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSaveLevel {
    LowPower,
    Balanced,
    Performance,
}

// ─── Flags observables desde fuera ───

#[derive(Default)]
struct StatusFlags {
    connected: bool,
    stopped: bool,
}

struct StationStatus {
    flags: Mutex<StatusFlags>,
    cond: Condvar,
}

// ─── Mensajes hacia el worker ───

// Los productores del event loop no cargan con datos: el worker lee
// resultados de scan o ip_info él mismo, con el driver en mano. El
// único mensaje con payload viene de la propia API pública.
enum WorkerMessage {
    Started,
    ScanDone,
    Disconnected,
    IpAcquired,
    RescanTick,
    SetScanIntervals { min: Duration, max: Duration },
    Shutdown,
}

// ─── La estación ───

/// Gestor de conexión WiFi en modo station. Se construye con sus
/// colaboradores explícitos (event loop, timer service, credenciales)
/// — sin singletons globales.
pub struct WifiStation {
    driver: Arc<Mutex<EspWifi<'static>>>,
    sysloop: EspSystemEventLoop,
    timer_service: EspTaskTimerService,
    status: Arc<StationStatus>,
    settings: StationSettings,
    known: Vec<KnownCredential>,
    // Compartido con el worker: los handlers se pueden (re)registrar
    // en cualquier momento y sobreviven a un stop()/start()
    callbacks: Arc<Mutex<StationCallbacks>>,
    tx: Option<Sender<WorkerMessage>>,
    subscriptions: Vec<EspSubscription<'static, System>>,
    worker: Option<JoinHandle<()>>,
}

impl WifiStation {
    /// Crea la estación sin arrancarla. `known` es la lista de redes
    /// del store, leída una vez: el core no la modifica jamás.
    pub fn new(
        modem: impl Peripheral<P = Modem> + 'static,
        sysloop: EspSystemEventLoop,
        timer_service: EspTaskTimerService,
        known: Vec<KnownCredential>,
        settings: StationSettings,
    ) -> Result<Self> {
        // None = el driver no persiste su propia config en flash;
        // nuestras credenciales ya viven en el CredentialStore.
        let driver = EspWifi::new(modem, sysloop.clone(), None)?;

        Ok(Self {
            driver: Arc::new(Mutex::new(driver)),
            sysloop,
            timer_service,
            status: Arc::new(StationStatus {
                flags: Mutex::new(StatusFlags::default()),
                cond: Condvar::new(),
            }),
            settings,
            known,
            callbacks: Arc::new(Mutex::new(StationCallbacks::default())),
            tx: None,
            subscriptions: Vec::new(),
            worker: None,
        })
    }

    // ─── Registro de callbacks (antes o después de start) ───

    pub fn on_scan_begin(&mut self, f: impl Fn() + Send + 'static) {
        self.callbacks.lock().unwrap().on_scan_begin = Some(Box::new(f));
    }

    pub fn on_connect(&mut self, f: impl Fn(&str) + Send + 'static) {
        self.callbacks.lock().unwrap().on_connect = Some(Box::new(f));
    }

    pub fn on_connected(&mut self, f: impl Fn(&str) + Send + 'static) {
        self.callbacks.lock().unwrap().on_connected = Some(Box::new(f));
    }

    pub fn on_disconnected(&mut self, f: impl Fn() + Send + 'static) {
        self.callbacks.lock().unwrap().on_disconnected = Some(Box::new(f));
    }

    /// Rango del backoff entre scans. Con la estación en marcha el
    /// cambio llega al worker y aplica desde el siguiente rescan;
    /// parada, queda guardado para el próximo start().
    pub fn set_scan_interval_range(&mut self, min: Duration, max: Duration) {
        self.settings.scan_min_interval = min;
        self.settings.scan_max_interval = max;
        if let Some(tx) = &self.tx {
            let _ = tx.send(WorkerMessage::SetScanIntervals { min, max });
        }
    }

    // ─── Control ───

    /// Arranca el radio y el worker. El evento StaStarted del propio
    /// radio dispara el primer scan — aquí no se escanea nada.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        {
            let mut flags = self.status.flags.lock().unwrap();
            flags.connected = false;
            flags.stopped = false;
        }

        let (tx, rx) = mpsc::channel();

        // Suscripciones: SOLO traducir y reenviar. Mutar estado aquí
        // sería compartir la máquina con el task de eventos de ESP-IDF.
        let wifi_tx = tx.clone();
        let wifi_sub = self.sysloop.subscribe::<WifiEvent, _>(move |event| match event {
            WifiEvent::StaStarted => {
                let _ = wifi_tx.send(WorkerMessage::Started);
            }
            WifiEvent::ScanDone(_) => {
                let _ = wifi_tx.send(WorkerMessage::ScanDone);
            }
            WifiEvent::StaDisconnected(_) => {
                let _ = wifi_tx.send(WorkerMessage::Disconnected);
            }
            _ => {}
        })?;

        let ip_tx = tx.clone();
        let ip_sub = self.sysloop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(_) = event {
                let _ = ip_tx.send(WorkerMessage::IpAcquired);
            }
        })?;
        self.subscriptions = vec![wifi_sub, ip_sub];

        let timer_tx = tx.clone();
        let rescan_timer = self.timer_service.timer(move || {
            let _ = timer_tx.send(WorkerMessage::RescanTick);
        })?;

        {
            let mut driver = self.driver.lock().unwrap();
            // Config mínima para poder hacer start() y scan()
            driver.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
            driver.start()?;
        }

        if self.settings.max_tx_power != 0 {
            // Override persistido, en unidades de 0.25 dBm
            if let Err(e) =
                sys::esp!(unsafe { sys::esp_wifi_set_max_tx_power(self.settings.max_tx_power) })
            {
                warn!("Failed to apply tx power override: {e}");
            }
        }

        let worker = StationWorker {
            core: StationCore::new(
                self.known.clone(),
                self.settings.scan_min_interval,
                self.settings.scan_max_interval,
            ),
            driver: Arc::clone(&self.driver),
            status: Arc::clone(&self.status),
            callbacks: Arc::clone(&self.callbacks),
            remember_bssid: self.settings.remember_bssid,
            rescan_timer,
            rx,
        };

        self.worker = Some(
            thread::Builder::new()
                .name("wifi_station".into())
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker.run())?,
        );
        self.tx = Some(tx);

        info!("WiFi station started ({} known networks)", self.known.len());
        Ok(())
    }

    /// Para todo: worker, timer, suscripciones y radio. Idempotente.
    pub fn stop(&mut self) {
        // Primero dejar de escuchar eventos; luego apagar el worker
        self.subscriptions.clear();

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WorkerMessage::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        {
            let mut driver = self.driver.lock().unwrap();
            let _ = driver.driver_mut().stop_scan();
            let _ = driver.disconnect();
            let _ = driver.stop();
        }

        let mut flags = self.status.flags.lock().unwrap();
        flags.connected = false;
        flags.stopped = true;
        self.status.cond.notify_all();

        info!("WiFi station stopped");
    }

    // ─── Observación ───

    pub fn is_connected(&self) -> bool {
        self.status.flags.lock().unwrap().connected
    }

    /// Bloquea hasta conectar, parar o agotar el timeout. Usa el par
    /// Mutex+Condvar de estado — nunca el camino de mutación del worker,
    /// así que no puede interbloquearse con él.
    pub fn wait_for_connected(&self, timeout: Duration) -> bool {
        let flags = self.status.flags.lock().unwrap();
        let (flags, _timed_out) = self
            .status
            .cond
            .wait_timeout_while(flags, timeout, |f| !f.connected && !f.stopped)
            .unwrap();
        flags.connected
    }

    /// RSSI del AP actual, 0 si no hay conexión.
    pub fn get_rssi(&self) -> i8 {
        if !self.is_connected() {
            return 0;
        }
        let mut ap_info = sys::wifi_ap_record_t::default();
        if unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == sys::ESP_OK {
            ap_info.rssi
        } else {
            0
        }
    }

    /// Canal del AP actual, 0 si no hay conexión.
    pub fn get_channel(&self) -> u8 {
        if !self.is_connected() {
            return 0;
        }
        let mut ap_info = sys::wifi_ap_record_t::default();
        if unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == sys::ESP_OK {
            ap_info.primary
        } else {
            0
        }
    }

    pub fn set_power_save_level(&self, level: PowerSaveLevel) -> Result<()> {
        let ps_type = match level {
            PowerSaveLevel::LowPower => sys::wifi_ps_type_t_WIFI_PS_MAX_MODEM,
            PowerSaveLevel::Balanced => sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM,
            PowerSaveLevel::Performance => sys::wifi_ps_type_t_WIFI_PS_NONE,
        };
        sys::esp!(unsafe { sys::esp_wifi_set_ps(ps_type) })?;
        Ok(())
    }
}

impl Drop for WifiStation {
    /// RAII: si la estación se dropea, la conexión se desmonta limpia.
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── El worker: core puro + ejecutor de efectos ───

struct StationWorker {
    core: StationCore,
    driver: Arc<Mutex<EspWifi<'static>>>,
    status: Arc<StationStatus>,
    callbacks: Arc<Mutex<StationCallbacks>>,
    remember_bssid: bool,
    rescan_timer: EspTimer<'static>,
    rx: Receiver<WorkerMessage>,
}

impl StationWorker {
    fn run(mut self) {
        info!("Station worker running");

        while let Ok(message) = self.rx.recv() {
            let event = match message {
                WorkerMessage::Shutdown => break,
                WorkerMessage::Started => Event::Started,
                WorkerMessage::RescanTick => Event::RescanTick,
                WorkerMessage::Disconnected => Event::Disconnected,
                WorkerMessage::SetScanIntervals { min, max } => {
                    Event::ScanIntervalsChanged { min, max }
                }
                WorkerMessage::ScanDone => match self.fetch_scan_results() {
                    Ok(hits) => Event::ScanCompleted(hits),
                    Err(e) => {
                        // Sin resultados no hay ciclo: tratarlo como
                        // scan fallido para que el timer reintente
                        warn!("Failed to read scan results: {e:?}");
                        Event::ScanFailed
                    }
                },
                WorkerMessage::IpAcquired => match self.read_ip_info() {
                    Ok((ip, gateway)) => {
                        info!("Got IP: {ip} (gateway {gateway})");
                        Event::IpAcquired { ip, gateway }
                    }
                    Err(e) => {
                        warn!("Failed to read ip info: {e:?}");
                        continue;
                    }
                },
            };

            self.dispatch(event);
        }

        let _ = self.rescan_timer.cancel();
        info!("Station worker stopped");
    }

    /// Aplica un evento y ejecuta sus efectos. Un comando que falla en
    /// seco devuelve un evento sintético (ScanFailed/ConnectFailed) que
    /// se procesa aquí mismo: tras cada vuelta o bien hay una conexión
    /// en el aire, o bien el timer de rescan queda armado. La máquina
    /// nunca se queda sin nada pendiente.
    fn dispatch(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for effect in self.core.apply(event) {
                if let Some(follow_up) = self.execute(effect) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    /// Lleva a cabo un efecto del core. Los fallos síncronos de comando
    /// se loguean y se devuelven como evento para que el core decida el
    /// siguiente paso.
    fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartScan => {
                if let Err(e) = self.start_scan() {
                    warn!("Scan start failed: {e:?}");
                    return Some(Event::ScanFailed);
                }
            }
            Effect::Connect(candidate) => {
                info!(
                    "Connecting to '{}' (RSSI {}, channel {})",
                    candidate.ssid, candidate.rssi, candidate.channel
                );
                if let Err(e) = self.connect(&candidate) {
                    warn!(
                        "Connect command for '{}' failed, skipping candidate: {e:?}",
                        candidate.ssid
                    );
                    return Some(Event::ConnectFailed);
                }
            }
            Effect::Reconnect => {
                info!(
                    "Disconnected, retrying... ({}/{})",
                    self.core.reconnect_count(),
                    MAX_RECONNECT_COUNT
                );
                if let Err(e) = self.driver.lock().unwrap().connect() {
                    warn!("Reconnect command failed: {e:?}");
                    return Some(Event::ConnectFailed);
                }
            }
            Effect::ArmRescan(delay) => {
                info!("No usable candidate, next scan in {}s", delay.as_secs());
                if let Err(e) = self.rescan_timer.after(delay) {
                    warn!("Failed to arm rescan timer: {e}");
                }
            }
            Effect::SetConnected(connected) => {
                let mut flags = self.status.flags.lock().unwrap();
                flags.connected = connected;
                self.status.cond.notify_all();
            }
            Effect::SpawnPortal(session) => {
                info!("Portal-eligible network, starting login agent");
                // El handoff no bloquea: la tarea corre por su cuenta
                portal::spawn_login_task(session);
            }
            notify @ (Effect::NotifyScanBegin
            | Effect::NotifyConnecting(_)
            | Effect::NotifyConnected(_)
            | Effect::NotifyDisconnected) => {
                self.callbacks.lock().unwrap().notify(&notify);
            }
        }
        None
    }

    // ─── Comandos contra el driver ───

    /// Scan activo no bloqueante; el resultado llega como ScanDone por
    /// el event loop.
    fn start_scan(&mut self) -> Result<()> {
        let config = ScanConfig {
            // Las redes ocultas también pueden estar en el store
            show_hidden: true,
            scan_type: ScanType::Active {
                min: SCAN_DWELL_MIN,
                max: SCAN_DWELL_MAX,
            },
            ..Default::default()
        };
        self.driver
            .lock()
            .unwrap()
            .driver_mut()
            .start_scan(&config, false)?;
        Ok(())
    }

    fn fetch_scan_results(&mut self) -> Result<Vec<ScanHit>> {
        let records = self.driver.lock().unwrap().driver_mut().get_scan_result()?;
        Ok(records
            .into_iter()
            .map(|ap| ScanHit {
                ssid: ap.ssid.to_string(),
                bssid: ap.bssid,
                channel: ap.channel,
                auth_method: ap.auth_method.unwrap_or(AuthMethod::None),
                rssi: ap.signal_strength,
            })
            .collect())
    }

    fn read_ip_info(&mut self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let driver = self.driver.lock().unwrap();
        let info = driver.sta_netif().get_ip_info()?;
        Ok((info.ip, info.subnet.gateway))
    }

    /// Configura el radio para el candidato y lanza el connect. El
    /// camino EAP y el camino personal son excluyentes: activar uno
    /// desactiva el otro.
    fn connect(&mut self, candidate: &CandidateRecord) -> Result<()> {
        let mut driver = self.driver.lock().unwrap();

        // Cortar cualquier intento anterior antes de reconfigurar
        let _ = driver.disconnect();

        if candidate.is_enterprise() {
            configure_enterprise(candidate)?;
        } else {
            // Sin EAP residual de un candidato anterior
            let _ = sys::esp!(unsafe { sys::esp_wifi_sta_enterprise_disable() });
        }

        let auth_method = if candidate.is_enterprise() {
            AuthMethod::WPA2Enterprise
        } else if candidate.password.is_empty() {
            AuthMethod::None
        } else {
            candidate.auth_method
        };

        // Los límites del protocolo: SSID de 32, password de 64
        let ssid: heapless::String<32> = candidate
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("SSID too long: {}", candidate.ssid))?;

        let mut config = ClientConfiguration {
            ssid,
            auth_method,
            ..Default::default()
        };

        if !candidate.is_enterprise() && auth_method != AuthMethod::None {
            let password: heapless::String<64> = candidate
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Password too long"))?;
            config.password = password;
        }

        // Con el flag persistido activo se fija el AP exacto del scan:
        // conexión más rápida, a cambio de no hacer roaming
        if self.remember_bssid {
            config.bssid = Some(candidate.bssid);
            config.channel = Some(candidate.channel);
        }

        driver.set_configuration(&Configuration::Client(config))?;
        driver.connect()?;
        Ok(())
    }
}

/// Identidad EAP por las llamadas crudas del IDF — esp-idf-svc todavía
/// no expone WPA2-Enterprise en la API segura.
fn configure_enterprise(candidate: &CandidateRecord) -> Result<()> {
    let username = candidate.username.as_deref().unwrap_or_default();

    unsafe {
        sys::esp!(sys::esp_eap_client_set_identity(
            username.as_ptr(),
            username.len() as i32
        ))?;
        sys::esp!(sys::esp_eap_client_set_username(
            username.as_ptr(),
            username.len() as i32
        ))?;
        sys::esp!(sys::esp_eap_client_set_password(
            candidate.password.as_ptr(),
            candidate.password.len() as i32
        ))?;
        sys::esp!(sys::esp_wifi_sta_enterprise_enable())?;
    }
    Ok(())
}
