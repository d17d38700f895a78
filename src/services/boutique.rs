// 精品工具：六个内置 HTML 模板，命中后无需调用 LLM 即刻返回。
use regex::Regex;
use std::sync::OnceLock;

const CONFIDENCE_THRESHOLD: f64 = 0.9;
const DEFAULT_WORK_MINUTES: u32 = 25;
const DEFAULT_BREAK_MINUTES: u32 = 5;

#[derive(Debug, Clone)]
pub struct BoutiqueMatch {
    pub tool: &'static str,
    pub title: String,
    pub content: String,
    pub confidence: f64,
}

struct ToolEntry {
    tool: &'static str,
    title: &'static str,
    patterns: &'static [&'static str],
}

const TOOLS: &[ToolEntry] = &[
    ToolEntry {
        tool: "calculator",
        title: "Calculator",
        patterns: &[
            r"(?i)\bcalculator\b",
            r"(?i)\b(build|create|make)\s+(me\s+)?(a\s+)?calc",
            r"(?i)\bdo\s+(some\s+)?math\b",
        ],
    },
    ToolEntry {
        tool: "pomodoro",
        title: "Pomodoro Timer",
        patterns: &[
            r"(?i)\bpomodoro\b",
            r"(?i)\b(work|focus)\s+timer\b",
            r"(?i)\btimer\s+(with|for)\s+breaks?\b",
        ],
    },
    ToolEntry {
        tool: "unit_converter",
        title: "Unit Converter",
        patterns: &[
            r"(?i)\bunit\s+converter\b",
            r"(?i)\bconvert\s+(units|between)\b",
            r"(?i)\b(miles|km|kg|pounds|celsius|fahrenheit)\s+(to|into)\b",
        ],
    },
    ToolEntry {
        tool: "stopwatch",
        title: "Stopwatch",
        patterns: &[
            r"(?i)\bstopwatch\b",
            r"(?i)\btime\s+(laps|how\s+long)\b",
            r"(?i)\blap\s+timer\b",
        ],
    },
    ToolEntry {
        tool: "word_counter",
        title: "Word Counter",
        patterns: &[
            r"(?i)\bword\s+count(er)?\b",
            r"(?i)\bcount\s+(my\s+)?(words|characters)\b",
            r"(?i)\bcharacter\s+count(er)?\b",
        ],
    },
    ToolEntry {
        tool: "color_picker",
        title: "Color Picker",
        patterns: &[
            r"(?i)\bcolou?r\s+picker\b",
            r"(?i)\bpick\s+(a\s+)?colou?r\b",
            r"(?i)\bhex\s+colou?r\b",
        ],
    },
];

fn compiled_tools() -> &'static Vec<(&'static ToolEntry, Vec<Regex>)> {
    static COMPILED: OnceLock<Vec<(&'static ToolEntry, Vec<Regex>)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        TOOLS
            .iter()
            .map(|entry| {
                let regexes = entry
                    .patterns
                    .iter()
                    .filter_map(|pattern| Regex::new(pattern).ok())
                    .collect();
                (entry, regexes)
            })
            .collect()
    })
}

/// 检测消息是否命中内置工具，低于阈值返回 None。
pub fn detect(message: &str) -> Option<BoutiqueMatch> {
    let text = message.trim();
    if text.is_empty() {
        return None;
    }
    let mut best: Option<(&ToolEntry, f64)> = None;
    for (entry, regexes) in compiled_tools() {
        if regexes.is_empty() {
            continue;
        }
        let hits = regexes.iter().filter(|re| re.is_match(text)).count();
        if hits == 0 {
            continue;
        }
        // 首条命中给 0.9，其后每条加 0.05，封顶 1.0。
        let confidence = (0.9 + 0.05 * (hits as f64 - 1.0)).min(1.0);
        if best.map(|(_, score)| confidence > score).unwrap_or(true) {
            best = Some((entry, confidence));
        }
    }
    let (entry, confidence) = best?;
    if confidence < CONFIDENCE_THRESHOLD {
        return None;
    }
    let content = render_tool(entry.tool, text);
    Some(BoutiqueMatch {
        tool: entry.tool,
        title: entry.title.to_string(),
        content,
        confidence,
    })
}

fn render_tool(tool: &str, message: &str) -> String {
    let template = match tool {
        "pomodoro" => {
            let (work, rest) = extract_timer_minutes(message);
            POMODORO_HTML
                .replace("__WORK_MINUTES__", &work.to_string())
                .replace("__BREAK_MINUTES__", &rest.to_string())
        }
        "calculator" => CALCULATOR_HTML.to_string(),
        "unit_converter" => UNIT_CONVERTER_HTML.to_string(),
        "stopwatch" => STOPWATCH_HTML.to_string(),
        "word_counter" => WORD_COUNTER_HTML.to_string(),
        "color_picker" => COLOR_PICKER_HTML.to_string(),
        _ => return String::new(),
    };
    template.replace("SAVE_LOAD", SAVE_LOAD_SNIPPET)
}

/// 松散抽取番茄钟参数，如 "25 minute work, 5 minute break"。
fn extract_timer_minutes(message: &str) -> (u32, u32) {
    static WORK_RE: OnceLock<Regex> = OnceLock::new();
    static BREAK_RE: OnceLock<Regex> = OnceLock::new();
    let work_re = WORK_RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3})\s*(?:minute|min)s?\s*(?:of\s+)?(?:work|focus)")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    });
    let break_re = BREAK_RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3})\s*(?:minute|min)s?\s*(?:of\s+)?(?:break|rest)")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    });
    let work = work_re
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|value| (1..=180).contains(value))
        .unwrap_or(DEFAULT_WORK_MINUTES);
    let rest = break_re
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|value| (1..=60).contains(value))
        .unwrap_or(DEFAULT_BREAK_MINUTES);
    (work, rest)
}

// 所有模板内联样式与脚本，并通过 postMessage 与宿主页交换保存/读取请求。
const SAVE_LOAD_SNIPPET: &str = r#"
function noahSave(state){parent.postMessage({type:'NOAH_SAVE_REQUEST',state:state},'*');}
function noahLoad(){parent.postMessage({type:'NOAH_LOAD_REQUEST'},'*');}
window.addEventListener('message',function(e){
  if(e.data&&e.data.type==='NOAH_LOAD_RESPONSE'&&typeof restoreState==='function'){restoreState(e.data.state);}
});
noahLoad();
"#;

const CALCULATOR_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Calculator</title>
<style>
body{font-family:system-ui,sans-serif;background:#111;display:flex;justify-content:center;padding:24px}
.calc{background:#1d1d1f;border-radius:16px;padding:16px;width:260px}
#display{width:100%;height:56px;font-size:28px;text-align:right;border:none;border-radius:8px;background:#000;color:#fff;padding:0 12px;box-sizing:border-box;margin-bottom:12px}
.keys{display:grid;grid-template-columns:repeat(4,1fr);gap:8px}
button{height:52px;font-size:20px;border:none;border-radius:8px;background:#333;color:#fff;cursor:pointer}
button.op{background:#f90}
button:active{filter:brightness(1.3)}
</style></head><body>
<div class="calc">
<input id="display" readonly value="0">
<div class="keys">
<button onclick="clearAll()">C</button><button onclick="press('(')">(</button><button onclick="press(')')">)</button><button class="op" onclick="press('/')">÷</button>
<button onclick="press('7')">7</button><button onclick="press('8')">8</button><button onclick="press('9')">9</button><button class="op" onclick="press('*')">×</button>
<button onclick="press('4')">4</button><button onclick="press('5')">5</button><button onclick="press('6')">6</button><button class="op" onclick="press('-')">−</button>
<button onclick="press('1')">1</button><button onclick="press('2')">2</button><button onclick="press('3')">3</button><button class="op" onclick="press('+')">+</button>
<button onclick="press('0')">0</button><button onclick="press('.')">.</button><button onclick="backspace()">⌫</button><button class="op" onclick="evaluate()">=</button>
</div></div>
<script>
var expr='';
function render(){document.getElementById('display').value=expr||'0';}
function press(ch){expr+=ch;render();}
function clearAll(){expr='';render();}
function backspace(){expr=expr.slice(0,-1);render();}
function evaluate(){
  if(!/^[0-9+\-*/().\s]+$/.test(expr))return;
  try{expr=String(Function('"use strict";return('+expr+')')());}catch(e){expr='Error';}
  render();noahSave({expr:expr});
}
function restoreState(s){if(s&&s.expr){expr=String(s.expr);render();}}
SAVE_LOAD
</script></body></html>"#;

const POMODORO_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Pomodoro Timer</title>
<style>
body{font-family:system-ui,sans-serif;background:#2b1515;color:#fff;display:flex;flex-direction:column;align-items:center;padding:32px}
#phase{font-size:18px;letter-spacing:2px;text-transform:uppercase;opacity:.7}
#clock{font-size:72px;font-variant-numeric:tabular-nums;margin:16px 0}
button{margin:4px;padding:10px 24px;font-size:16px;border:none;border-radius:8px;background:#e25555;color:#fff;cursor:pointer}
</style></head><body>
<div id="phase">Work</div>
<div id="clock">00:00</div>
<div>
<button onclick="startTimer()">Start</button>
<button onclick="pauseTimer()">Pause</button>
<button onclick="resetTimer()">Reset</button>
</div>
<script>
var workMinutes=__WORK_MINUTES__,breakMinutes=__BREAK_MINUTES__;
var remaining=workMinutes*60,onBreak=false,handle=null;
function render(){
  var m=Math.floor(remaining/60),s=remaining%60;
  document.getElementById('clock').textContent=(m<10?'0':'')+m+':'+(s<10?'0':'')+s;
  document.getElementById('phase').textContent=onBreak?'Break':'Work';
}
function tick(){
  if(remaining>0){remaining--;render();return;}
  onBreak=!onBreak;
  remaining=(onBreak?breakMinutes:workMinutes)*60;
  render();noahSave({onBreak:onBreak});
}
function startTimer(){if(!handle)handle=setInterval(tick,1000);}
function pauseTimer(){clearInterval(handle);handle=null;}
function resetTimer(){pauseTimer();onBreak=false;remaining=workMinutes*60;render();}
function restoreState(s){if(s&&typeof s.onBreak==='boolean'){onBreak=s.onBreak;remaining=(onBreak?breakMinutes:workMinutes)*60;render();}}
render();
SAVE_LOAD
</script></body></html>"#;

const UNIT_CONVERTER_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Unit Converter</title>
<style>
body{font-family:system-ui,sans-serif;background:#10202b;color:#fff;display:flex;justify-content:center;padding:32px}
.panel{background:#1a3345;border-radius:12px;padding:20px;width:320px}
select,input{width:100%;padding:8px;margin:6px 0;border-radius:6px;border:none;font-size:16px;box-sizing:border-box}
#result{font-size:22px;margin-top:12px;min-height:28px}
</style></head><body>
<div class="panel">
<select id="kind" onchange="convert()">
<option value="km_mi">Kilometers → Miles</option>
<option value="mi_km">Miles → Kilometers</option>
<option value="kg_lb">Kilograms → Pounds</option>
<option value="lb_kg">Pounds → Kilograms</option>
<option value="c_f">Celsius → Fahrenheit</option>
<option value="f_c">Fahrenheit → Celsius</option>
</select>
<input id="amount" type="number" placeholder="Amount" oninput="convert()">
<div id="result"></div>
</div>
<script>
var factors={km_mi:function(v){return v*0.621371},mi_km:function(v){return v/0.621371},
kg_lb:function(v){return v*2.20462},lb_kg:function(v){return v/2.20462},
c_f:function(v){return v*9/5+32},f_c:function(v){return (v-32)*5/9}};
function convert(){
  var kind=document.getElementById('kind').value;
  var amount=parseFloat(document.getElementById('amount').value);
  var out=document.getElementById('result');
  if(isNaN(amount)){out.textContent='';return;}
  out.textContent=factors[kind](amount).toFixed(4);
  noahSave({kind:kind,amount:amount});
}
function restoreState(s){
  if(!s)return;
  if(s.kind)document.getElementById('kind').value=s.kind;
  if(typeof s.amount==='number')document.getElementById('amount').value=s.amount;
  convert();
}
SAVE_LOAD
</script></body></html>"#;

const STOPWATCH_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Stopwatch</title>
<style>
body{font-family:system-ui,sans-serif;background:#101a12;color:#fff;display:flex;flex-direction:column;align-items:center;padding:32px}
#clock{font-size:64px;font-variant-numeric:tabular-nums;margin:12px 0}
button{margin:4px;padding:10px 24px;font-size:16px;border:none;border-radius:8px;background:#2d8a4e;color:#fff;cursor:pointer}
#laps{margin-top:16px;font-variant-numeric:tabular-nums;opacity:.85}
</style></head><body>
<div id="clock">0:00.0</div>
<div>
<button onclick="startWatch()">Start</button>
<button onclick="stopWatch()">Stop</button>
<button onclick="lap()">Lap</button>
<button onclick="resetWatch()">Reset</button>
</div>
<ol id="laps"></ol>
<script>
var startAt=0,elapsed=0,handle=null;
function format(ms){
  var t=Math.floor(ms/100),tenths=t%10,s=Math.floor(t/10)%60,m=Math.floor(t/600);
  return m+':'+(s<10?'0':'')+s+'.'+tenths;
}
function render(){document.getElementById('clock').textContent=format(elapsed);}
function startWatch(){if(handle)return;startAt=Date.now()-elapsed;handle=setInterval(function(){elapsed=Date.now()-startAt;render();},100);}
function stopWatch(){clearInterval(handle);handle=null;}
function lap(){
  var item=document.createElement('li');
  item.textContent=format(elapsed);
  document.getElementById('laps').appendChild(item);
  noahSave({elapsed:elapsed});
}
function resetWatch(){stopWatch();elapsed=0;render();document.getElementById('laps').innerHTML='';}
function restoreState(s){if(s&&typeof s.elapsed==='number'){elapsed=s.elapsed;render();}}
render();
SAVE_LOAD
</script></body></html>"#;

const WORD_COUNTER_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Word Counter</title>
<style>
body{font-family:system-ui,sans-serif;background:#1c1426;color:#fff;display:flex;justify-content:center;padding:24px}
.panel{width:480px;max-width:95vw}
textarea{width:100%;height:220px;border-radius:8px;border:none;padding:12px;font-size:15px;box-sizing:border-box;resize:vertical}
#stats{margin-top:12px;font-size:18px;display:flex;gap:24px}
</style></head><body>
<div class="panel">
<textarea id="text" placeholder="Paste or type your text..." oninput="update()"></textarea>
<div id="stats"><span id="words">0 words</span><span id="chars">0 characters</span></div>
</div>
<script>
function update(){
  var text=document.getElementById('text').value;
  var words=(text.match(/\S+/g)||[]).length;
  document.getElementById('words').textContent=words+' words';
  document.getElementById('chars').textContent=text.length+' characters';
  noahSave({text:text});
}
function restoreState(s){if(s&&typeof s.text==='string'){document.getElementById('text').value=s.text;update();}}
SAVE_LOAD
</script></body></html>"#;

const COLOR_PICKER_HTML: &str = r##"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Color Picker</title>
<style>
body{font-family:system-ui,sans-serif;background:#222;color:#fff;display:flex;flex-direction:column;align-items:center;padding:32px}
#swatch{width:160px;height:160px;border-radius:16px;border:2px solid #555;margin:16px 0}
input[type=color]{width:80px;height:48px;border:none;background:none;cursor:pointer}
#hex{font-size:24px;font-variant-numeric:tabular-nums;margin-top:8px}
button{margin-top:12px;padding:8px 20px;border:none;border-radius:8px;background:#555;color:#fff;cursor:pointer}
</style></head><body>
<input type="color" id="picker" value="#4488ff" oninput="update()">
<div id="swatch"></div>
<div id="hex">#4488ff</div>
<button onclick="copyHex()">Copy hex</button>
<script>
function update(){
  var value=document.getElementById('picker').value;
  document.getElementById('swatch').style.background=value;
  document.getElementById('hex').textContent=value;
  noahSave({color:value});
}
function copyHex(){
  var value=document.getElementById('hex').textContent;
  if(navigator.clipboard)navigator.clipboard.writeText(value);
}
function restoreState(s){if(s&&s.color){document.getElementById('picker').value=s.color;update();}}
update();
SAVE_LOAD
</script></body></html>"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrelated_text_not_detected() {
        assert!(detect("what's the capital of France?").is_none());
        assert!(detect("").is_none());
    }

    #[test]
    fn test_calculator_detected() {
        let found = detect("build me a calculator").unwrap();
        assert_eq!(found.tool, "calculator");
        assert!(found.confidence >= 0.9);
        assert!(found.content.contains("<!DOCTYPE html>"));
        assert!(found.content.contains("NOAH_SAVE_REQUEST"));
        assert!(found.content.contains("NOAH_LOAD_REQUEST"));
    }

    #[test]
    fn test_pomodoro_parameter_extraction() {
        let found = detect("make me a pomodoro timer with 50 minute work and 10 minute break").unwrap();
        assert_eq!(found.tool, "pomodoro");
        assert!(found.content.contains("workMinutes=50"));
        assert!(found.content.contains("breakMinutes=10"));
    }

    #[test]
    fn test_pomodoro_defaults() {
        let found = detect("I need a pomodoro timer").unwrap();
        assert!(found.content.contains("workMinutes=25"));
        assert!(found.content.contains("breakMinutes=5"));
    }

    #[test]
    fn test_multiple_hits_raise_confidence() {
        let one = detect("stopwatch").unwrap();
        let two = detect("stopwatch to time laps").unwrap();
        assert!(two.confidence > one.confidence);
    }

    #[test]
    fn test_all_templates_render() {
        for tool in [
            "calculator",
            "pomodoro",
            "unit_converter",
            "stopwatch",
            "word_counter",
            "color_picker",
        ] {
            let html = render_tool(tool, "");
            assert!(html.contains("<!DOCTYPE html>"), "{tool} missing doctype");
        }
    }
}
