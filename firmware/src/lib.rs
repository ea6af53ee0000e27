// ─── Paso 3: WiFi Manager — firmware ───
//
// La mitad con hardware del gestor: driver EspWifi, NVS, HTTP y
// threads. Toda la política de decisión vive en wifi-core; aquí solo
// se ejecuta. El binario (main.rs) hace el bring-up.

pub mod credentials;
pub mod portal;
pub mod station;
