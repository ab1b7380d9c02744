//! Централизованная конфигурация OTR движка
//!
//! Все константы и настройки, которые хост может переопределить,
//! определены здесь, чтобы избежать хардкода по всему проекту.
//! Протокольные константы (группа DH, длины хэшей) живут в `crypto::math`
//! и `protocol::version` и не настраиваются.

use std::sync::OnceLock;

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// Длина случайного DH экспонента для AKE и ротации ключей (в байтах)
    pub ake_exponent_length: usize,

    /// Длина случайных экспонент SMP (в байтах)
    pub smp_parameter_length: usize,

    /// Максимальное количество MAC ключей, ожидающих раскрытия
    pub max_pending_mac_keys: usize,

    // ============================================
    // ФРАГМЕНТАЦИЯ
    // ============================================

    /// Максимальный размер исходящего сообщения; 0 отключает фрагментацию
    pub default_fragment_size: u16,

    // ============================================
    // ВРЕМЕННЫЕ ПАРАМЕТРЫ
    // ============================================

    /// Окно, в течение которого отложенные сообщения переотправляются после AKE (в секундах)
    pub resend_interval_secs: u64,

    /// Минимальный интервал между heartbeat сообщениями (в секундах)
    pub heartbeat_interval_secs: u64,

    // ============================================
    // ПЕРЕОТПРАВКА
    // ============================================

    /// Префикс для переотправленных сообщений
    pub default_resend_prefix: String,
}

impl Config {
    /// Создать конфигурацию с дефолтными значениями
    pub fn default() -> Self {
        Self {
            // Криптография
            ake_exponent_length: 40,
            smp_parameter_length: 192,
            max_pending_mac_keys: 256,

            // Фрагментация
            default_fragment_size: 0,

            // Временные параметры
            resend_interval_secs: 60,
            heartbeat_interval_secs: 60,

            // Переотправка
            default_resend_prefix: "[resent] ".to_string(),
        }
    }

    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Переопределяем значения из env, если они заданы
        if let Ok(val) = std::env::var("OTR_FRAGMENT_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.default_fragment_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_RESEND_INTERVAL_SECS") {
            if let Ok(parsed) = val.parse() {
                config.resend_interval_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(parsed) = val.parse() {
                config.heartbeat_interval_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_RESEND_PREFIX") {
            config.default_resend_prefix = val;
        }

        if let Ok(val) = std::env::var("OTR_MAX_PENDING_MAC_KEYS") {
            if let Ok(parsed) = val.parse() {
                config.max_pending_mac_keys = parsed;
            }
        }

        config
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }

    /// Проверить, инициализирована ли глобальная конфигурация
    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ake_exponent_length, 40);
        assert_eq!(config.smp_parameter_length, 192);
        assert_eq!(config.default_fragment_size, 0);
    }

    #[test]
    fn test_config_values() {
        let config = Config::default();

        // Timing
        assert_eq!(config.resend_interval_secs, 60);
        assert_eq!(config.heartbeat_interval_secs, 60);

        // Resend
        assert_eq!(config.default_resend_prefix, "[resent] ");
        assert_eq!(config.max_pending_mac_keys, 256);
    }

    #[test]
    fn test_global_is_lazily_initialized() {
        let config = Config::global();
        assert!(Config::is_initialized());
        assert!(Config::init_with(config.clone()).is_err());
    }
}
