// ─── Paso 3: Módulo Credentials — Redes conocidas en NVS ───
//
// NVS (Non-Volatile Storage) es la "flash persistente" del ESP32.
// Aquí guardamos la lista ordenada de redes conocidas que el gestor
// de conexión consume: cada entrada es {ssid, password, username?}.
//
// Las credenciales se borran de memoria automáticamente al salir
// de scope gracias a Zeroize/ZeroizeOnDrop (igual que en el paso 2).

use anyhow::Result;
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{info, warn};
use zeroize::Zeroize;

// El tipo de entrada lo define wifi-core: la máquina de estados casa
// redes conocidas con resultados de scan sin saber de NVS.
pub use wifi_core::state::KnownCredential;

// ─── Constantes NVS ───

const CREDS_NAMESPACE: &str = "wifi_creds";
const KEY_COUNT: &str = "count";

// Ajustes del radio, escritos por la herramienta de aprovisionamiento.
// Nosotros solo los leemos, una vez, al construir la estación.
const RADIO_NAMESPACE: &str = "wifi";
const KEY_MAX_TX_POWER: &str = "max_tx_power";
const KEY_REMEMBER_BSSID: &str = "remember_bssid";

// ─── Store de credenciales ───

/// Lista ordenada de redes conocidas, persistida en NVS como claves
/// indexadas (`ssid_0`, `pass_0`, `user_0`, ...) más un contador.
pub struct CredentialStore {
    nvs: EspNvs<NvsDefault>,
}

impl CredentialStore {
    /// `true` en EspNvs::new = crear el namespace si no existe.
    pub fn new(partition: EspNvsPartition<NvsDefault>) -> Result<Self> {
        let nvs = EspNvs::new(partition, CREDS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    /// Devuelve todas las redes conocidas, en el orden en que se
    /// guardaron. Una entrada malformada (SSID vacío) se salta con un
    /// warning — nunca tumba el arranque.
    pub fn list(&self) -> Result<Vec<KnownCredential>> {
        let count = self.nvs.get_u8(KEY_COUNT)?.unwrap_or(0);
        let mut entries = Vec::with_capacity(count as usize);

        // Buffer temporal para lecturas — se zeroiza después de cada uso
        let mut buf = [0u8; 256];

        for index in 0..count {
            let mut cred = KnownCredential::default();

            if let Some(val) = self.nvs.get_str(&format!("ssid_{index}"), &mut buf)? {
                cred.ssid = val.trim_end_matches('\0').to_string();
                buf.zeroize();
            }
            if let Some(val) = self.nvs.get_str(&format!("pass_{index}"), &mut buf)? {
                cred.password = val.trim_end_matches('\0').to_string();
                buf.zeroize();
            }
            if let Some(val) = self.nvs.get_str(&format!("user_{index}"), &mut buf)? {
                let user = val.trim_end_matches('\0');
                if !user.is_empty() {
                    cred.username = Some(user.to_string());
                }
                buf.zeroize();
            }

            if cred.ssid.is_empty() {
                warn!("Skipping malformed credential entry {index}");
                continue;
            }
            entries.push(cred);
        }

        info!("Loaded {} stored network(s)", entries.len());
        Ok(entries)
    }

    /// Añade una red al final de la lista y zeroiza la entrada.
    pub fn add(&mut self, mut cred: KnownCredential) -> Result<()> {
        let index = self.nvs.get_u8(KEY_COUNT)?.unwrap_or(0);

        self.nvs.set_str(&format!("ssid_{index}"), &cred.ssid)?;
        self.nvs.set_str(&format!("pass_{index}"), &cred.password)?;
        self.nvs
            .set_str(&format!("user_{index}"), cred.username.as_deref().unwrap_or(""))?;
        self.nvs.set_u8(KEY_COUNT, index + 1)?;

        info!("Stored network '{}' at slot {index}", cred.ssid);
        cred.zeroize();
        Ok(())
    }

    /// Borra todas las redes guardadas (factory reset).
    /// Sobreescribe con strings vacíos antes de poner el contador a 0.
    #[allow(dead_code)]
    pub fn clear(&mut self) -> Result<()> {
        let count = self.nvs.get_u8(KEY_COUNT)?.unwrap_or(0);
        warn!("Clearing {count} stored network(s) from NVS...");

        for index in 0..count {
            self.nvs.set_str(&format!("ssid_{index}"), "")?;
            self.nvs.set_str(&format!("pass_{index}"), "")?;
            self.nvs.set_str(&format!("user_{index}"), "")?;
        }
        self.nvs.set_u8(KEY_COUNT, 0)?;
        Ok(())
    }
}

// ─── Ajustes persistidos del radio ───

/// Overrides del radio guardados por el aprovisionamiento:
/// potencia máxima de transmisión (unidades de 0.25 dBm, 0 = sin
/// override) y si fijar BSSID+canal del AP al conectar.
#[derive(Debug, Clone, Copy, Default)]
pub struct RadioSettings {
    pub max_tx_power: i8,
    pub remember_bssid: bool,
}

impl RadioSettings {
    /// Lee los ajustes una sola vez. Namespace ausente o claves
    /// ausentes = valores por defecto, nunca un error.
    pub fn load(partition: EspNvsPartition<NvsDefault>) -> Self {
        let nvs = match EspNvs::new(partition, RADIO_NAMESPACE, false) {
            Ok(nvs) => nvs,
            Err(_) => return Self::default(),
        };

        Self {
            max_tx_power: nvs.get_i8(KEY_MAX_TX_POWER).ok().flatten().unwrap_or(0),
            remember_bssid: nvs
                .get_u8(KEY_REMEMBER_BSSID)
                .ok()
                .flatten()
                .unwrap_or(0)
                == 1,
        }
    }
}
