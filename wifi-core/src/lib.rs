// ─── Paso 3: wifi-core — la política de conexión ───
//
// El paso 2 conectaba a UNA red con una llamada bloqueante. Este paso
// convierte eso en un gestor de conectividad completo: varias redes
// conocidas, selección por potencia de señal, reconexión con política
// acotada, rescan con backoff exponencial y login automático contra
// portales cautivos.
//
// Este crate es la mitad PURA de ese gestor: ni radio, ni timers, ni
// red. Compila para cualquier target, así que toda la política se
// testea con `cargo test -p wifi-core` en el host, sin un ESP32
// delante. El firmware (firmware/) aporta el driver, los eventos y el
// HTTP reales.

pub mod portal;
pub mod state;
