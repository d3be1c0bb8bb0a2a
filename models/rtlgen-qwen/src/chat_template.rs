use std::fmt::Display;

use minijinja::{context, Environment, ErrorKind};
use minijinja_contrib::pycompat;
use rtlgen_session::{ChatFormatter, ChatMessage};

#[cfg(test)]
use pretty_assertions::assert_eq;

/// The ChatML template Qwen instruct models are trained with. Used when the
/// checkpoint does not ship its own template.
pub const CHATML_TEMPLATE: &str = r#"{%- if messages[0]['role'] != 'system' %}
    {{- '<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n' }}
{%- endif %}
{%- for message in messages %}
    {{- '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n' }}
{%- endfor %}
{%- if add_generation_prompt %}
    {{- '<|im_start|>assistant\n' }}
{%- endif %}"#;

pub(crate) struct HuggingFaceChatTemplate {
    environment: Environment<'static>,
}

impl HuggingFaceChatTemplate {
    pub(crate) fn create(chat_template: impl Display) -> Result<Self, minijinja::Error> {
        let chat_template = chat_template.to_string();
        let mut environment = Environment::new();
        // transformers renders templates with both of these enabled
        environment.set_trim_blocks(true);
        environment.set_lstrip_blocks(true);

        // most templates are written against python's string methods
        environment.set_unknown_method_callback(pycompat::unknown_method_callback);

        let raise_exception = |err_text: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("The template raised an exception: {}", err_text),
            ))
        };
        environment.add_function("raise_exception", raise_exception);

        environment.add_template_owned("main", chat_template)?;

        Ok(Self { environment })
    }

    fn run(
        &self,
        bos_token: &str,
        eos_token: &str,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, minijinja::Error> {
        let ctx = context! { bos_token, eos_token, messages, add_generation_prompt };
        let template = self.environment.get_template("main")?;
        template.render(&ctx)
    }
}

/// Renders chat messages with a checkpoint's chat template.
pub struct QwenChatFormatter {
    template: HuggingFaceChatTemplate,
    bos_token: String,
    eos_token: String,
}

impl QwenChatFormatter {
    /// Compile a Hugging Face (jinja) chat template.
    pub fn new(
        chat_template: impl Display,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self, minijinja::Error> {
        Ok(Self {
            template: HuggingFaceChatTemplate::create(chat_template)?,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    /// The ChatML formatter Qwen models use.
    pub fn chatml() -> Result<Self, minijinja::Error> {
        Self::new(CHATML_TEMPLATE, "", "<|im_end|>")
    }
}

impl ChatFormatter for QwenChatFormatter {
    type Error = minijinja::Error;

    fn format_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, Self::Error> {
        self.template.run(
            &self.bos_token,
            &self.eos_token,
            messages,
            add_generation_prompt,
        )
    }
}

#[test]
fn test_chatml_template() {
    let formatter = QwenChatFormatter::chatml().unwrap();
    let messages = [
        ChatMessage::system("You are an expert Verilog and RTL design engineer."),
        ChatMessage::user("Write a 4-bit up counter with synchronous reset."),
    ];

    let result = formatter.format_chat(&messages, true).unwrap();
    assert_eq!(
        result,
        r#"<|im_start|>system
You are an expert Verilog and RTL design engineer.<|im_end|>
<|im_start|>user
Write a 4-bit up counter with synchronous reset.<|im_end|>
<|im_start|>assistant
"#
    );

    let result = formatter.format_chat(&messages[1..], false).unwrap();
    assert_eq!(
        result,
        r#"<|im_start|>system
You are a helpful assistant.<|im_end|>
<|im_start|>user
Write a 4-bit up counter with synchronous reset.<|im_end|>
"#
    );
}

#[test]
fn test_qwen_chat_template() {
    let template = r#"{%- if tools %}
    {{- '<|im_start|>system\n' }}
    {%- if messages[0]['role'] == 'system' %}
        {{- messages[0]['content'] }}
    {%- else %}
        {{- 'You are Qwen, created by Alibaba Cloud. You are a helpful assistant.' }}
    {%- endif %}
    {{- "\n\n# Tools\n\nYou may call one or more functions to assist with the user query.\n\nYou are provided with function signatures within <tools></tools> XML tags:\n<tools>" }}
    {%- for tool in tools %}
        {{- "\n" }}
        {{- tool | tojson }}
    {%- endfor %}
    {{- "\n</tools>\n\nFor each function call, return a json object with function name and arguments within <tool_call></tool_call> XML tags:\n<tool_call>\n{{\"name\": <function-name>, \"arguments\": <args-json-object>}}\n</tool_call><|im_end|>\n" }}
{%- else %}
    {%- if messages[0]['role'] == 'system' %}
        {{- '<|im_start|>system\n' + messages[0]['content'] + '<|im_end|>\n' }}
    {%- else %}
        {{- '<|im_start|>system\nYou are Qwen, created by Alibaba Cloud. You are a helpful assistant.<|im_end|>\n' }}
    {%- endif %}
{%- endif %}
{%- for message in messages %}
    {%- if (message.role == "user") or (message.role == "system" and not loop.first) or (message.role == "assistant" and not message.tool_calls) %}
        {{- '<|im_start|>' + message.role + '\n' + message.content + '<|im_end|>' + '\n' }}
    {%- elif message.role == "assistant" %}
        {{- '<|im_start|>' + message.role }}
        {%- if message.content %}
            {{- '\n' + message.content }}
        {%- endif %}
        {{- '<|im_end|>\n' }}
    {%- endif %}
{%- endfor %}
{%- if add_generation_prompt %}
    {{- '<|im_start|>assistant\n' }}
{%- endif %}"#;

    let formatter = QwenChatFormatter::new(template, "", "<|im_end|>").unwrap();

    let messages = [
        ChatMessage::system("You are an expert Verilog and RTL design engineer."),
        ChatMessage::user("Implement a parameterized synchronous FIFO."),
    ];

    let result = formatter.format_chat(&messages, true).unwrap();
    assert_eq!(
        result,
        r#"<|im_start|>system
You are an expert Verilog and RTL design engineer.<|im_end|>
<|im_start|>user
Implement a parameterized synchronous FIFO.<|im_end|>
<|im_start|>assistant
"#
    );
}

#[test]
fn test_llama_chat_template() {
    let template = "{% set loop_messages = messages %}{% for message in loop_messages %}{% set content = '<|start_header_id|>' + message['role'] + '<|end_header_id|>\n\n'+ message['content'] | trim + '<|eot_id|>' %}{% if loop.index0 == 0 %}{% set content = bos_token + content %}{% endif %}{{ content }}{% endfor %}{% if add_generation_prompt %}{{ '<|start_header_id|>assistant<|end_header_id|>\n\n' }}{% endif %}";

    let formatter =
        QwenChatFormatter::new(template, "<|begin_of_text|>", "<|end_of_text|>").unwrap();

    let messages = [
        ChatMessage::system("You are an expert Verilog and RTL design engineer."),
        ChatMessage::user("  A 2:1 mux.  "),
    ];

    let result = formatter.format_chat(&messages, true).unwrap();

    assert_eq!(
        result,
        r#"<|begin_of_text|><|start_header_id|>system<|end_header_id|>

You are an expert Verilog and RTL design engineer.<|eot_id|><|start_header_id|>user<|end_header_id|>

A 2:1 mux.<|eot_id|><|start_header_id|>assistant<|end_header_id|>

"#
    )
}

#[test]
fn test_raise_exception() {
    let template = "{{ raise_exception('Only user messages are supported') }}";
    let formatter = QwenChatFormatter::new(template, "", "").unwrap();
    let err = formatter
        .format_chat(&[ChatMessage::user("hi")], true)
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("The template raised an exception: Only user messages are supported"));
}
