// ─── Paso 3: WiFi Manager — Conectividad gestionada + portal cautivo ───
//
// El paso 2 conectaba a UNA red con una llamada bloqueante. Ahora el
// ESP32 gestiona su conectividad solo: escanea las redes conocidas,
// elige la de mejor señal, reconecta al caerse (con política acotada),
// reescanea con backoff exponencial y, si la red lo intercepta con un
// portal de login, intenta pasarlo automáticamente.
//
// La política de decisión (cola de candidatos, backoff, clasificación
// de portal) vive en wifi-core; aquí está el hardware: credentials,
// station y portal sobre esp-idf.

// ─── Imports ───

use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::PinDriver;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::timer::EspTaskTimerService;

#[allow(unused_imports)]
use esp_idf_svc::sys as _;

use anyhow::bail;
use log::{error, info, warn};
use std::time::Duration;

use wifi_manager::credentials::{CredentialStore, KnownCredential, RadioSettings};
use wifi_manager::station::{PowerSaveLevel, StationSettings, WifiStation};

// ─── Punto de entrada ───
//
// Patrón main() → run(): main() no retorna Result, así que no puede
// usar ?. Si run() falla, logueamos, esperamos 10s y reiniciamos.

fn main() {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("paso-03-wifi-manager");

    if let Err(e) = run() {
        error!("Error fatal: {:?}", e);
        error!("Reiniciando en 10 segundos...");
        std::thread::sleep(Duration::from_secs(10));
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }
}

fn run() -> anyhow::Result<()> {
    // ─── Inicialización del sistema ───

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let timer_service = EspTaskTimerService::new()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // LED en GPIO8 — herencia del paso 1, sigue como heartbeat
    let mut led = PinDriver::output(peripherals.pins.gpio8)?;

    // ─── Redes conocidas ───

    let mut store = CredentialStore::new(nvs_partition.clone())?;
    let mut known = store.list()?;

    // Semilla de compilación para desarrollo: si el store está vacío,
    // WIFI_SSID / WIFI_PASS / WIFI_USER del entorno de build se
    // guardan como primera red.
    if known.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            let cred = KnownCredential {
                ssid: ssid.to_string(),
                password: option_env!("WIFI_PASS").unwrap_or("").to_string(),
                username: option_env!("WIFI_USER").map(str::to_string),
            };
            store.add(cred.clone())?;
            known.push(cred);
        }
    }

    if known.is_empty() {
        // El modo de configuración por AP queda fuera de este paso
        bail!("No WiFi networks stored; provision the device first");
    }

    // ─── La estación ───

    let settings = StationSettings::from_radio(RadioSettings::load(nvs_partition));

    let mut station = WifiStation::new(
        peripherals.modem,
        sysloop,
        timer_service,
        known,
        settings,
    )?;

    // Observadores de ciclo de vida: aquí solo logueamos; una placa
    // con display mostraría notificaciones con esto mismo.
    station.on_scan_begin(|| info!("Scanning for known networks..."));
    station.on_connect(|ssid| info!("Connecting to '{ssid}'..."));
    station.on_connected(|ssid| info!("Connected to '{ssid}'"));
    station.on_disconnected(|| warn!("WiFi connection lost, station will retry"));

    station.start()?;

    // ─── Espera inicial ───

    if station.wait_for_connected(Duration::from_secs(60)) {
        info!(
            "WiFi is up (RSSI {} dBm, channel {})",
            station.get_rssi(),
            station.get_channel()
        );
        // Con la conexión arriba, ahorro de energía moderado
        if let Err(e) = station.set_power_save_level(PowerSaveLevel::Balanced) {
            warn!("Power save config failed: {e:?}");
        }
    } else {
        // No es fatal: la estación sigue escaneando con backoff
        warn!("Not connected after 60s, still retrying in background");
    }

    // ─── Loop principal: heartbeat + estado del enlace ───

    let mut ticks: u32 = 0;
    loop {
        led.set_high()?;
        FreeRtos::delay_ms(500);
        led.set_low()?;
        FreeRtos::delay_ms(500);

        ticks = ticks.wrapping_add(1);
        if ticks % 10 == 0 && station.is_connected() {
            info!(
                "Link: RSSI {} dBm, channel {}",
                station.get_rssi(),
                station.get_channel()
            );
        }
    }
}
